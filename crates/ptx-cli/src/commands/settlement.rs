//! Phase, custody and order maintenance commands.

use anyhow::Result;
use chrono::Utc;
use ptx_schemas::AssetKind;

use super::Core;

pub async fn phase_show(core: &Core) -> Result<()> {
    for p in core.phases.phases().await? {
        println!(
            "phase={} seq={} price={} cap={} active={} start_height={} end_height={}",
            p.label,
            p.seq,
            p.price_per_unit,
            p.supply_cap,
            p.active,
            opt(p.start_height),
            opt(p.end_height),
        );
    }
    match core.phases.get_active_phase().await? {
        Some(a) => {
            println!("active={}", a.label);
            println!("sold={}", a.sold);
            println!("reserved={}", a.reserved);
            println!("remaining={}", a.remaining);
            println!("stale={}", a.stale);
        }
        None => println!("active=NONE"),
    }
    Ok(())
}

pub async fn phase_advance(core: &Core) -> Result<()> {
    let next = core.phases.advance_phase().await?;
    println!("advanced=true phase={} seq={}", next.label, next.seq);
    Ok(())
}

pub async fn custody_balance(core: &Core, asset: AssetKind) -> Result<()> {
    let balance = core.escrow.custody_balance(asset).await?;
    println!(
        "account={} asset={} balance_minor={}",
        core.escrow.custody_account(),
        asset.as_str(),
        balance
    );
    Ok(())
}

pub async fn expire_sweep(core: &Core) -> Result<()> {
    let sweep = core.orders.expire_overdue(Utc::now()).await?;
    println!(
        "expired={} skipped={} stranded={}",
        sweep.expired.len(),
        sweep.skipped.len(),
        sweep.stranded.len()
    );
    for id in sweep.expired {
        println!("expired_order={id}");
    }
    for s in sweep.stranded {
        println!(
            "stranded_order={} status={} expires_at={} escrow_tx_ref={}",
            s.id,
            s.status.as_str(),
            s.expires_at.to_rfc3339(),
            opt(s.escrow_tx_ref)
        );
    }
    Ok(())
}

fn opt<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map(|x| x.to_string()).unwrap_or_else(|| "NONE".to_string())
}
