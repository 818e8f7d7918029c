use std::collections::HashSet;

use anyhow::{anyhow, Result};

use crate::config::LanesConfig;

/// One independently scheduled round-cycle slot. Compiled once at startup,
/// never mutated.
#[derive(Debug, Clone)]
pub(crate) struct Lane {
    pub(crate) index: u8,
    pub(crate) period_hours: u32,
    pub(crate) ticket_price: u64,
    pub(crate) max_tickets: u32,
    pub(crate) dev_fee_bps: u16,
}

impl Lane {
    pub(crate) fn period_secs(&self) -> i64 {
        self.period_hours as i64 * 3600
    }

    pub(crate) fn period_ms(&self) -> i64 {
        self.period_secs() * 1000
    }
}

pub(crate) fn compile_lanes(cfg: &LanesConfig) -> Result<Vec<Lane>> {
    let k = cfg.period_hours.len();
    if k == 0 {
        return Err(anyhow!("lane table is empty"));
    }
    if cfg.ticket_price.len() != k || cfg.max_tickets.len() != k || cfg.dev_fee_bps.len() != k {
        return Err(anyhow!(
            "lane tables must have equal lengths: periods={} prices={} tickets={} fees={}",
            k,
            cfg.ticket_price.len(),
            cfg.max_tickets.len(),
            cfg.dev_fee_bps.len()
        ));
    }
    if k > u8::MAX as usize {
        return Err(anyhow!("too many lanes: {k}"));
    }

    // Lane identity is derived from the period when matching open rounds,
    // so duplicate periods would make two lanes fight over one round.
    let mut seen = HashSet::new();
    for hours in &cfg.period_hours {
        if *hours == 0 {
            return Err(anyhow!("lane period must be positive"));
        }
        if !seen.insert(*hours) {
            return Err(anyhow!("duplicate lane period: {hours}h"));
        }
    }

    let lanes = (0..k)
        .map(|i| Lane {
            index: i as u8,
            period_hours: cfg.period_hours[i],
            ticket_price: cfg.ticket_price[i],
            max_tickets: cfg.max_tickets[i],
            dev_fee_bps: cfg.dev_fee_bps[i],
        })
        .collect();
    Ok(lanes)
}

pub(crate) fn lane_for_period_hours(lanes: &[Lane], hours: u32) -> Option<&Lane> {
    lanes.iter().find(|l| l.period_hours == hours)
}
