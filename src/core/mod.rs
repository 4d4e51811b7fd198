mod engine;
mod solver;
mod types;

pub use engine::{simulate, terminal_gap};
pub use solver::{find_max_annual_expense, find_required_portfolio};
pub use types::{
    OneOffEvent, RatePeriod, SimulationTrace, SolverConfig, WithdrawalTiming, average_rates,
    horizon_years, yearly_periods,
};
