use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use super::request::{
    ApiWithdrawalTime, OneOffPayload, PeriodPayload, PlanPayload, build_plan, required_portfolio,
    required_withdrawal,
};
use super::{ApiError, CalculationMode, calculate, run_http_server};
use crate::core::{SimulationTrace, SolverConfig, WithdrawalTiming, simulate, terminal_gap};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliWithdrawalTime {
    Start,
    End,
}

impl From<CliWithdrawalTime> for ApiWithdrawalTime {
    fn from(value: CliWithdrawalTime) -> Self {
        match value {
            CliWithdrawalTime::Start => ApiWithdrawalTime::Start,
            CliWithdrawalTime::End => ApiWithdrawalTime::End,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "fire-calc",
    about = "Deterministic FIRE calculator (required portfolio, sustainable withdrawal)"
)]
pub struct Cli {
    #[command(flatten)]
    solver: SolverArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Copy)]
struct SolverArgs {
    #[arg(
        long,
        global = true,
        default_value_t = 0.01,
        help = "Bisection stops once the bracket is this narrow (currency units)"
    )]
    tolerance: f64,
    #[arg(
        long,
        global = true,
        default_value_t = 1_000_000_000.0,
        help = "Largest starting portfolio the portfolio search will consider"
    )]
    portfolio_ceiling: f64,
    #[arg(
        long,
        global = true,
        default_value_t = 1.0,
        help = "Smallest upper bound for the withdrawal search"
    )]
    withdrawal_floor: f64,
    #[arg(long, global = true, default_value_t = 100)]
    max_iterations: u32,
}

impl SolverArgs {
    fn into_config(self) -> Result<SolverConfig, ApiError> {
        let config = SolverConfig {
            tolerance: self.tolerance,
            portfolio_ceiling: self.portfolio_ceiling,
            withdrawal_floor: self.withdrawal_floor,
            max_iterations: self.max_iterations,
        };
        config.validate().map_err(ApiError::InvalidConfig)?;
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Portfolio required to fund an annual withdrawal.
    Portfolio {
        #[arg(long, help = "First-year withdrawal; grows with inflation")]
        withdrawal: f64,
        #[command(flatten)]
        plan: PlanArgs,
    },
    /// Largest first-year withdrawal a portfolio can sustain.
    Expense {
        #[arg(long)]
        portfolio: f64,
        #[command(flatten)]
        plan: PlanArgs,
    },
    /// Year-by-year balances for a fixed portfolio and withdrawal.
    Simulate {
        #[arg(long)]
        portfolio: f64,
        #[arg(long)]
        withdrawal: f64,
        #[command(flatten)]
        plan: PlanArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    #[arg(long, value_enum, default_value_t = CliWithdrawalTime::Start)]
    withdrawal_time: CliWithdrawalTime,
    #[arg(
        long,
        allow_hyphen_values = true,
        help = "Annual nominal return in percent, e.g. 7"
    )]
    return_rate: Option<f64>,
    #[arg(
        long,
        allow_hyphen_values = true,
        help = "Annual inflation in percent, e.g. 3"
    )]
    inflation_rate: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    years: Option<i64>,
    #[arg(
        long = "period",
        value_parser = parse_period,
        help = "YEARS:RETURN:INFLATION in percent; repeat for consecutive periods"
    )]
    periods: Vec<PeriodPayload>,
    #[arg(
        long = "one-off",
        value_parser = parse_one_off,
        help = "YEAR:AMOUNT; negative amounts are expenses"
    )]
    one_offs: Vec<OneOffPayload>,
    #[arg(long, default_value_t = 0.0)]
    target_final_value: f64,
}

impl PlanArgs {
    fn into_payload(self, withdrawal: Option<f64>, portfolio: Option<f64>) -> PlanPayload {
        PlanPayload {
            withdrawal_time: Some(self.withdrawal_time.into()),
            annual_withdrawal: withdrawal,
            portfolio,
            target_final_value: Some(self.target_final_value),
            return_rate: self.return_rate,
            inflation_rate: self.inflation_rate,
            years: self.years,
            periods: Some(self.periods),
            one_offs: self.one_offs,
            ..PlanPayload::default()
        }
    }
}

fn parse_period(raw: &str) -> Result<PeriodPayload, String> {
    let parts = raw.split(':').map(str::trim).collect::<Vec<_>>();
    let [years, return_rate, inflation_rate] = parts.as_slice() else {
        return Err(format!("expected YEARS:RETURN:INFLATION, got '{raw}'"));
    };
    Ok(PeriodPayload {
        years: years
            .parse()
            .map_err(|_| format!("invalid period years '{years}'"))?,
        return_rate: return_rate
            .parse()
            .map_err(|_| format!("invalid period return '{return_rate}'"))?,
        inflation_rate: inflation_rate
            .parse()
            .map_err(|_| format!("invalid period inflation '{inflation_rate}'"))?,
    })
}

fn parse_one_off(raw: &str) -> Result<OneOffPayload, String> {
    let (year, amount) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected YEAR:AMOUNT, got '{raw}'"))?;
    Ok(OneOffPayload {
        year: year
            .trim()
            .parse()
            .map_err(|_| format!("invalid one-off year '{year}'"))?,
        amount: amount
            .trim()
            .parse()
            .map_err(|_| format!("invalid one-off amount '{amount}'"))?,
        description: None,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateOutput {
    withdrawal_time: WithdrawalTiming,
    portfolio: f64,
    annual_withdrawal: f64,
    final_balance: f64,
    terminal_gap: f64,
    trace: SimulationTrace,
}

fn simulate_output(payload: &PlanPayload) -> Result<SimulateOutput, ApiError> {
    let plan = build_plan(payload)?;
    let portfolio = required_portfolio(payload)?;
    let withdrawal = required_withdrawal(payload)?;
    let trace = simulate(portfolio, withdrawal, plan.timing, &plan.schedule, &plan.events);
    let gap = terminal_gap(
        portfolio,
        withdrawal,
        plan.timing,
        &plan.schedule,
        plan.target_final_value,
        &plan.events,
    );
    Ok(SimulateOutput {
        withdrawal_time: plan.timing,
        portfolio,
        annual_withdrawal: withdrawal,
        final_balance: trace.final_balance(),
        terminal_gap: gap,
        trace,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), ApiError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run(cli: Cli) -> Result<(), ApiError> {
    let config = cli.solver.into_config()?;
    match cli.command {
        Command::Serve { port } => run_http_server(port, config).await?,
        Command::Portfolio { withdrawal, plan } => {
            let payload = plan.into_payload(Some(withdrawal), None);
            print_json(&calculate(CalculationMode::Withdrawal, &payload, &config)?)?;
        }
        Command::Expense { portfolio, plan } => {
            let payload = plan.into_payload(None, Some(portfolio));
            print_json(&calculate(CalculationMode::Portfolio, &payload, &config)?)?;
        }
        Command::Simulate {
            portfolio,
            withdrawal,
            plan,
        } => {
            let payload = plan.into_payload(Some(withdrawal), Some(portfolio));
            print_json(&simulate_output(&payload)?)?;
        }
    }
    Ok(())
}
