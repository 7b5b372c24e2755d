//! Commands that write the shared store from outside a running server.
//!
//! A running `serve` sees these changes through its dispatcher's periodic
//! `notifications()` read, since the commit here happens in another process.

use anyhow::{Context, Result};

use crate::{
    config::SiteConfig,
    events::descriptor::normalize_page,
    log,
    store::{Store, solutions},
};

fn open(config: &SiteConfig) -> Result<Store> {
    Store::open(&config.store.path, config.store.settings())
        .with_context(|| format!("failed to open {}", config.store.path.display()))
}

/// Bump the counter of every key. Returns the new sequence numbers.
pub fn notify(config: &SiteConfig, keys: &[String]) -> Result<Vec<u32>> {
    let store = open(config)?;
    let mut conn = store.connect()?;
    let mut txn = store.transaction(&mut conn)?;
    let seqs = txn.notify(keys)?;
    txn.commit()?;

    for (key, seq) in keys.iter().zip(&seqs) {
        log!("notify"; "{} -> {}", key, seq);
    }
    Ok(seqs)
}

/// Show or hide the solutions of `page`.
pub fn set_solutions(config: &SiteConfig, page: &str, visible: bool) -> Result<()> {
    let page = normalize_page(page);
    if !page.starts_with('/') {
        anyhow::bail!("page must start with `/`: {page}");
    }

    let store = open(config)?;
    let mut conn = store.connect()?;
    let mut txn = store.transaction(&mut conn)?;
    solutions::set_visible(&mut txn, &page, visible)?;
    txn.commit()?;

    log!("solutions"; "{} {}", if visible { "shown on" } else { "hidden on" }, page);
    Ok(())
}
