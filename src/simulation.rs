//! Deterministic simulated market feed for paper hedging.
//!
//! Walks the underlying price with a seeded log-normal step and quotes the
//! group's spot, perpetual and a listed option chain priced with
//! Black-Scholes (zero rates).

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::f64::consts::PI;
use std::sync::Arc;

use crate::config::GroupConfig;
use crate::market::{Instrument, MarketField, MarketUpdate, OptionKind, VenueId};
use crate::utils::decimal::{from_f64, to_f64};

const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;

/// Standard normal CDF via the Abramowitz-Stegun erf approximation.
fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / 2.0_f64.sqrt()))
}

fn norm_pdf(x: f64) -> f64 {
    (-(x * x) / 2.0).exp() / (2.0 * PI).sqrt()
}

fn erf(x: f64) -> f64 {
    let (a1, a2, a3, a4, a5, p) = (
        0.254829592,
        -0.284496736,
        1.421413741,
        -1.453152027,
        1.061405429,
        0.3275911,
    );
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();
    sign * y
}

/// Price and per-unit greeks of a European option.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionValuation {
    pub price: f64,
    pub delta: f64,
    pub gamma: f64,
    /// Per calendar day
    pub theta: f64,
    /// Per vol point
    pub vega: f64,
}

pub fn black_scholes(kind: OptionKind, spot: f64, strike: f64, years: f64, vol: f64) -> OptionValuation {
    if years <= 0.0 || vol <= 0.0 {
        let (price, delta) = match kind {
            OptionKind::Call if spot > strike => (spot - strike, 1.0),
            OptionKind::Put if spot < strike => (strike - spot, -1.0),
            _ => (0.0, 0.0),
        };
        return OptionValuation {
            price,
            delta,
            gamma: 0.0,
            theta: 0.0,
            vega: 0.0,
        };
    }

    let sqrt_t = years.sqrt();
    let d1 = ((spot / strike).ln() + vol * vol / 2.0 * years) / (vol * sqrt_t);
    let d2 = d1 - vol * sqrt_t;
    let pdf = norm_pdf(d1);

    let (price, delta) = match kind {
        OptionKind::Call => (spot * norm_cdf(d1) - strike * norm_cdf(d2), norm_cdf(d1)),
        OptionKind::Put => (strike * norm_cdf(-d2) - spot * norm_cdf(-d1), norm_cdf(d1) - 1.0),
    };

    OptionValuation {
        price,
        delta,
        gamma: pdf / (spot * vol * sqrt_t),
        theta: -(spot * pdf * vol) / (2.0 * sqrt_t) / 365.0,
        vega: spot * pdf * sqrt_t / 100.0,
    }
}

/// Seeded xorshift generator; the feed must replay identically.
#[derive(Debug, Clone)]
struct XorShift(u64);

impl XorShift {
    fn next_f64(&mut self) -> f64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Standard normal draw (Box-Muller).
    fn next_gaussian(&mut self) -> f64 {
        let u1 = self.next_f64().max(f64::MIN_POSITIVE);
        let u2 = self.next_f64();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }
}

/// Quotes for one instrument group.
#[derive(Debug, Clone)]
pub struct SimulatedFeed {
    venue: VenueId,
    spot: Arc<Instrument>,
    perp: Arc<Instrument>,
    options: Vec<Arc<Instrument>>,
    price: f64,
    vol: f64,
    rng: XorShift,
    last_step: Option<DateTime<Utc>>,
}

impl SimulatedFeed {
    /// Build the feed and list the group's option chain from `listed_at`.
    pub fn new(group: &GroupConfig, listed_at: DateTime<Utc>, seed: u64) -> Self {
        let chain = &group.options;
        let start = to_f64(chain.start_price);
        let underlying = group.underlying.as_str();

        let mut options = Vec::new();
        for days in &chain.expiry_days {
            let expiry = listed_at + Duration::days(i64::from(*days));
            for ratio in &chain.strike_ratios {
                let strike = (chain.start_price * *ratio).round();
                for kind in [OptionKind::Put, OptionKind::Call] {
                    let suffix = match kind {
                        OptionKind::Put => "P",
                        OptionKind::Call => "C",
                    };
                    options.push(Arc::new(Instrument::option(
                        format!("{}-{}-{}-{}", underlying, expiry.format("%Y%m%d"), strike, suffix),
                        underlying,
                        kind,
                        strike,
                        expiry,
                        chain.multiplier,
                        chain.lot_size,
                    )));
                }
            }
        }

        Self {
            venue: VenueId::new("sim"),
            spot: Arc::new(Instrument::spot(
                group.spot_instrument.as_str(),
                underlying,
                group.spot_lot_size,
            )),
            perp: Arc::new(Instrument::perpetual(
                group.policy.hedge_instrument.as_str(),
                underlying,
                group.perp_multiplier,
                group.perp_lot_size,
            )),
            options,
            price: start,
            vol: to_f64(chain.simulated_vol),
            rng: XorShift(seed.max(1)),
            last_step: None,
        }
    }

    pub fn spot(&self) -> &Arc<Instrument> {
        &self.spot
    }

    pub fn perp(&self) -> &Arc<Instrument> {
        &self.perp
    }

    pub fn instruments(&self) -> Vec<Arc<Instrument>> {
        let mut all = vec![self.spot.clone(), self.perp.clone()];
        all.extend(self.options.iter().cloned());
        all
    }

    pub fn price(&self) -> Decimal {
        from_f64(self.price)
    }

    /// Synthetic daily closes ending yesterday, for seeding VaR history.
    pub fn daily_closes(&mut self, days: usize, today: NaiveDate) -> Vec<(NaiveDate, Decimal)> {
        let daily_vol = self.vol / 365.0_f64.sqrt();
        let mut price = self.price;
        let mut closes = Vec::with_capacity(days);
        for back in 1..=days {
            closes.push((today - Duration::days(back as i64), from_f64(price)));
            price *= (daily_vol * self.rng.next_gaussian()).exp();
        }
        closes.reverse();
        closes
    }

    /// Advance the price to `now` and emit a full set of quotes.
    pub fn next_updates(&mut self, now: DateTime<Utc>) -> Vec<MarketUpdate> {
        if let Some(last) = self.last_step {
            let dt = (now - last).num_milliseconds().max(0) as f64 / 1000.0 / SECONDS_PER_YEAR;
            if dt > 0.0 {
                let shock = self.rng.next_gaussian();
                self.price *= (-0.5 * self.vol * self.vol * dt + self.vol * dt.sqrt() * shock).exp();
            }
        }
        self.last_step = Some(now);

        let mid = from_f64(self.price);
        let vol = from_f64(self.vol);
        let mut updates = vec![
            MarketUpdate::new(self.spot.id.clone(), MarketField::Mid, mid, now, self.venue.clone()),
            MarketUpdate::new(self.spot.id.clone(), MarketField::ImpliedVol, vol, now, self.venue.clone()),
            MarketUpdate::new(self.spot.id.clone(), MarketField::Liquidity, Decimal::from(80), now, self.venue.clone()),
            MarketUpdate::new(self.perp.id.clone(), MarketField::Mid, mid, now, self.venue.clone()),
        ];

        for option in &self.options {
            let Some(terms) = option.spec.option.as_ref() else {
                continue;
            };
            let years = (terms.expiry - now).num_seconds().max(0) as f64 / SECONDS_PER_YEAR;
            let v = black_scholes(terms.kind, self.price, to_f64(terms.strike), years, self.vol);
            let fields = [
                (MarketField::Mid, v.price),
                (MarketField::ImpliedVol, self.vol),
                (MarketField::Delta, v.delta),
                (MarketField::Gamma, v.gamma),
                (MarketField::Theta, v.theta),
                (MarketField::Vega, v.vega),
            ];
            for (field, value) in fields {
                updates.push(MarketUpdate::new(
                    option.id.clone(),
                    field,
                    from_f64(value),
                    now,
                    self.venue.clone(),
                ));
            }
        }
        updates
    }
}
