use serde::Serialize;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalTiming {
    Start,
    End,
}

/// One constant-rate segment of the horizon. Rates are fractions (0.05 = 5%).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RatePeriod {
    pub duration_years: u32,
    pub nominal_return: f64,
    pub inflation: f64,
}

impl RatePeriod {
    pub fn new(duration_years: u32, nominal_return: f64, inflation: f64) -> Self {
        Self {
            duration_years,
            nominal_return,
            inflation,
        }
    }
}

/// Extra cash flow applied once, in the 1-indexed `year` of the horizon.
/// Positive amounts are income, negative amounts are expenses.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct OneOffEvent {
    pub year: u32,
    pub amount: f64,
}

impl OneOffEvent {
    pub fn new(year: u32, amount: f64) -> Self {
        Self { year, amount }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationTrace {
    pub years: Vec<u32>,
    pub balances: Vec<f64>,
    pub withdrawals: Vec<f64>,
}

impl SimulationTrace {
    pub(crate) fn with_horizon(horizon: u32) -> Self {
        let len = horizon as usize;
        Self {
            years: (0..=horizon).collect(),
            balances: Vec::with_capacity(len + 1),
            withdrawals: Vec::with_capacity(len),
        }
    }

    pub fn horizon_years(&self) -> u32 {
        self.withdrawals.len() as u32
    }

    pub fn final_balance(&self) -> f64 {
        self.balances.last().copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverConfig {
    /// Absolute width at which bisection stops, in currency units.
    pub tolerance: f64,
    /// Largest starting portfolio the portfolio solver will consider.
    pub portfolio_ceiling: f64,
    /// Smallest upper bound for the withdrawal search.
    pub withdrawal_floor: f64,
    /// Cap on both bracket expansion and bisection steps.
    pub max_iterations: u32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.01,
            portfolio_ceiling: 1_000_000_000.0,
            withdrawal_floor: 1.0,
            max_iterations: 100,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err("tolerance must be > 0".to_string());
        }
        if !self.portfolio_ceiling.is_finite() || self.portfolio_ceiling <= 0.0 {
            return Err("portfolio_ceiling must be > 0".to_string());
        }
        if !self.withdrawal_floor.is_finite() || self.withdrawal_floor <= 0.0 {
            return Err("withdrawal_floor must be > 0".to_string());
        }
        if self.max_iterations == 0 {
            return Err("max_iterations must be > 0".to_string());
        }
        Ok(())
    }
}

/// Total number of simulated years in a schedule, saturating at `u32::MAX`.
pub fn horizon_years(schedule: &[RatePeriod]) -> u32 {
    schedule
        .iter()
        .fold(0u32, |acc, p| acc.saturating_add(p.duration_years))
}

/// Duration-weighted mean `(return, inflation)` across the schedule.
pub fn average_rates(schedule: &[RatePeriod]) -> (f64, f64) {
    let horizon = horizon_years(schedule);
    if horizon == 0 {
        return (0.0, 0.0);
    }
    let (weighted_return, weighted_inflation) =
        schedule.iter().fold((0.0, 0.0), |(r, i), p| {
            let years = p.duration_years as f64;
            (r + p.nominal_return * years, i + p.inflation * years)
        });
    let years = horizon as f64;
    (weighted_return / years, weighted_inflation / years)
}

/// Yields the active period once per simulated year, in order. Periods never
/// split a year, and zero-length periods are skipped.
pub fn yearly_periods(schedule: &[RatePeriod]) -> impl Iterator<Item = &RatePeriod> {
    schedule
        .iter()
        .flat_map(|p| std::iter::repeat_n(p, p.duration_years as usize))
}
