use anyhow::Result;
use ptx_reconcile::EntryOutcome;

use super::Core;

/// One full reputation pass; prints a summary line then one line per entry.
pub async fn reputation(core: &Core, dry_run: bool) -> Result<()> {
    if !core.settings.reputation.enabled {
        eprintln!("note: reputation sync is disabled in config; running on request anyway");
    }
    let report = core.reputation.run_pass(dry_run).await?;
    println!(
        "dry_run={} processed={} updated={} noops={} skipped={} errors={}",
        dry_run, report.processed, report.updated, report.noops, report.skipped, report.errors
    );
    for e in &report.details {
        let account = e.account.as_deref().unwrap_or("NONE");
        let detail = match &e.outcome {
            EntryOutcome::Updated { tx_ref, .. } => format!("updated tx_ref={tx_ref}"),
            EntryOutcome::Noop { reason, .. } => format!("noop reason={reason}"),
            EntryOutcome::Skipped { reason } => format!("skipped reason={reason}"),
            EntryOutcome::Error { reason } => format!("error reason={reason}"),
        };
        println!("user={} account={} {}", e.user_id, account, detail);
    }
    if report.errors > 0 {
        anyhow::bail!("{} reputation entr(ies) failed", report.errors);
    }
    Ok(())
}
