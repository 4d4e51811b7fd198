use super::types::{
    OneOffEvent, RatePeriod, SimulationTrace, WithdrawalTiming, horizon_years, yearly_periods,
};

/// Runs the year-by-year portfolio walk and returns the full trace.
///
/// `balances[t]` is the balance before year `t`'s activity for END timing, and the
/// balance right after year `t`'s withdrawal for START timing. The final entry is
/// always the balance after the whole horizon. Negative balances are kept as-is.
pub fn simulate(
    portfolio: f64,
    initial_withdrawal: f64,
    timing: WithdrawalTiming,
    schedule: &[RatePeriod],
    events: &[OneOffEvent],
) -> SimulationTrace {
    let mut trace = SimulationTrace::with_horizon(horizon_years(schedule));
    let final_balance = run_simulation(
        portfolio,
        initial_withdrawal,
        timing,
        schedule,
        events,
        Some(&mut trace),
    );
    trace.balances.push(final_balance);
    trace
}

/// Final balance minus `target`. Non-decreasing in `portfolio` and non-increasing in
/// `initial_withdrawal` whenever every yearly growth factor is non-negative.
pub fn terminal_gap(
    portfolio: f64,
    initial_withdrawal: f64,
    timing: WithdrawalTiming,
    schedule: &[RatePeriod],
    target: f64,
    events: &[OneOffEvent],
) -> f64 {
    run_simulation(portfolio, initial_withdrawal, timing, schedule, events, None) - target
}

fn run_simulation(
    portfolio: f64,
    initial_withdrawal: f64,
    timing: WithdrawalTiming,
    schedule: &[RatePeriod],
    events: &[OneOffEvent],
    mut trace: Option<&mut SimulationTrace>,
) -> f64 {
    let mut balance = portfolio;
    let mut withdrawal = initial_withdrawal;

    for (year_index, period) in yearly_periods(schedule).enumerate() {
        let one_offs = one_off_total(events, year_index as u32 + 1);
        let growth = 1.0 + period.nominal_return;

        match timing {
            WithdrawalTiming::Start => {
                balance -= withdrawal;
                if let Some(trace) = trace.as_deref_mut() {
                    trace.balances.push(balance);
                    trace.withdrawals.push(withdrawal);
                }
                balance += one_offs;
                balance *= growth;
            }
            WithdrawalTiming::End => {
                if let Some(trace) = trace.as_deref_mut() {
                    trace.balances.push(balance);
                    trace.withdrawals.push(withdrawal);
                }
                balance += one_offs;
                balance *= growth;
                balance -= withdrawal;
            }
        }

        // next year's withdrawal inflates at this period's rate
        withdrawal *= 1.0 + period.inflation;
    }

    balance
}

fn one_off_total(events: &[OneOffEvent], year: u32) -> f64 {
    events
        .iter()
        .filter(|event| event.year == year)
        .map(|event| event.amount)
        .sum()
}
