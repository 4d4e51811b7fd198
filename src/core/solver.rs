use tracing::debug;

use super::engine::terminal_gap;
use super::types::{
    OneOffEvent, RatePeriod, SolverConfig, WithdrawalTiming, average_rates, horizon_years,
};

/// Smallest starting portfolio whose final balance reaches `target_final_value`.
///
/// Returns `f64::INFINITY` when no portfolio up to `config.portfolio_ceiling` is
/// enough, or when the bracket cannot be established within `config.max_iterations`.
pub fn find_required_portfolio(
    initial_withdrawal: f64,
    timing: WithdrawalTiming,
    schedule: &[RatePeriod],
    target_final_value: f64,
    events: &[OneOffEvent],
    config: &SolverConfig,
) -> f64 {
    let horizon = horizon_years(schedule);
    if horizon == 0 {
        return target_final_value;
    }
    if initial_withdrawal == 0.0 && target_final_value == 0.0 {
        return 0.0;
    }

    let gap = |portfolio: f64| {
        terminal_gap(
            portfolio,
            initial_withdrawal,
            timing,
            schedule,
            target_final_value,
            events,
        )
    };

    let mut lower = 0.0;
    if gap(lower) >= 0.0 {
        return lower;
    }

    let seed = portfolio_seed(initial_withdrawal, timing, schedule, target_final_value);
    let mut upper = (seed * 1.5).max(lower + 100.0).min(config.portfolio_ceiling);

    let total_withdrawn = initial_withdrawal * horizon as f64;
    let mut expansions = 0;
    while gap(upper) < 0.0 {
        expansions += 1;
        if expansions > config.max_iterations || upper >= config.portfolio_ceiling {
            debug!(upper, expansions, "portfolio search exhausted");
            return f64::INFINITY;
        }
        let next = if initial_withdrawal > 0.0 && upper < total_withdrawn {
            total_withdrawn * 2.0
        } else {
            upper * 2.0
        };
        upper = next.min(config.portfolio_ceiling);
    }

    let mut iterations = 0;
    while upper - lower > config.tolerance && iterations < config.max_iterations {
        iterations += 1;
        let mid = (lower + upper) * 0.5;
        if mid <= lower || mid >= upper {
            break;
        }
        if gap(mid) < 0.0 {
            lower = mid;
        } else {
            upper = mid;
        }
    }

    debug!(seed, expansions, iterations, upper, "portfolio search converged");
    upper
}

/// Largest first-year withdrawal `portfolio` can sustain while still ending at or
/// above `target_final_value`. Returns `0.0` when no positive withdrawal works.
pub fn find_max_annual_expense(
    portfolio: f64,
    timing: WithdrawalTiming,
    schedule: &[RatePeriod],
    target_final_value: f64,
    events: &[OneOffEvent],
    config: &SolverConfig,
) -> f64 {
    let horizon = horizon_years(schedule);
    if horizon == 0 {
        return 0.0;
    }

    let gap = |withdrawal: f64| {
        terminal_gap(
            portfolio,
            withdrawal,
            timing,
            schedule,
            target_final_value,
            events,
        )
    };

    let (avg_return, avg_inflation) = average_rates(schedule);
    let available = portfolio + discounted_events(events, avg_return, horizon)
        - discount(target_final_value, avg_return, horizon);
    if available <= 0.0 {
        let zero_gap = gap(0.0);
        let floor_gap = gap(config.withdrawal_floor);
        debug!(available, zero_gap, floor_gap, "portfolio does not cover the discounted target");
        if floor_gap < 0.0 {
            return 0.0;
        }
    }

    let factor = annuity_factor(avg_return, avg_inflation, horizon, timing);
    let seed = if factor.is_finite() && factor > 0.0 {
        available / factor
    } else {
        available
    };
    let mut upper = (seed * 1.5).max(config.withdrawal_floor);

    // Multi-period schedules and one-off income can make the seed too low.
    let mut expansions = 0;
    while gap(upper) >= 0.0 && expansions < config.max_iterations {
        expansions += 1;
        upper *= 2.0;
    }

    let mut lower = 0.0;
    let mut iterations = 0;
    while upper - lower > config.tolerance && iterations < config.max_iterations {
        iterations += 1;
        let mid = (lower + upper) * 0.5;
        if mid <= lower || mid >= upper {
            break;
        }
        if gap(mid) < 0.0 {
            upper = mid;
        } else {
            lower = mid;
        }
    }

    if gap(lower) < -config.tolerance {
        debug!(lower, "no sustainable positive withdrawal");
        return 0.0;
    }

    debug!(seed, expansions, iterations, lower, "withdrawal search converged");
    lower
}

/// Closed-form portfolio estimate using the schedule's average rates. Exact for a
/// single period with no one-off events; only used to seed the bracket.
fn portfolio_seed(
    initial_withdrawal: f64,
    timing: WithdrawalTiming,
    schedule: &[RatePeriod],
    target_final_value: f64,
) -> f64 {
    let horizon = horizon_years(schedule);
    let (avg_return, avg_inflation) = average_rates(schedule);
    let annuity = initial_withdrawal
        * annuity_factor(avg_return, avg_inflation, horizon, WithdrawalTiming::End);
    let mut seed = annuity + discount(target_final_value, avg_return, horizon);
    if timing == WithdrawalTiming::Start {
        seed *= 1.0 + avg_return;
    }

    if seed.is_finite() && seed >= 0.0 {
        seed
    } else {
        initial_withdrawal.max(0.0) * horizon as f64
    }
}

/// Present value of a withdrawal stream starting at 1.0 and growing at `inflation`,
/// discounted at `nominal_return`.
fn annuity_factor(
    nominal_return: f64,
    inflation: f64,
    years: u32,
    timing: WithdrawalTiming,
) -> f64 {
    let n = years as f64;
    let growth = 1.0 + nominal_return;
    let end_factor = if (nominal_return - inflation).abs() < 1e-12 {
        n / growth
    } else {
        (1.0 - ((1.0 + inflation) / growth).powf(n)) / (nominal_return - inflation)
    };
    match timing {
        WithdrawalTiming::Start => end_factor * growth,
        WithdrawalTiming::End => end_factor,
    }
}

/// Value at year 0 of the events applied within the horizon. An event for year `y`
/// lands before that year's growth, so it is discounted over `y - 1` years.
fn discounted_events(events: &[OneOffEvent], nominal_return: f64, horizon: u32) -> f64 {
    events
        .iter()
        .filter(|e| (1..=horizon).contains(&e.year))
        .map(|e| discount(e.amount, nominal_return, e.year - 1))
        .sum()
}

fn discount(value: f64, nominal_return: f64, years: u32) -> f64 {
    let growth = (1.0 + nominal_return).powf(years as f64);
    if growth > 0.0 && growth.is_finite() {
        value / growth
    } else {
        value
    }
}
