mod cli;
mod request;

use axum::{
    Router,
    extract::{Json, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::{
    SimulationTrace, SolverConfig, WithdrawalTiming, find_max_annual_expense,
    find_required_portfolio, simulate,
};

pub use cli::{Cli, Command, run};
pub use request::{
    ApiWithdrawalTime, MAX_HORIZON_YEARS, OneOffPayload, PeriodPayload, Plan, PlanPayload,
    RequestError, build_plan, required_portfolio, required_withdrawal,
};

pub const MAX_SCENARIOS_COMPARE: usize = 4;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    InvalidRequest(#[from] RequestError),
    #[error(
        "Cannot find a suitable portfolio below {ceiling}. Withdrawals may be too high or periods too long/unfavorable."
    )]
    Infeasible { ceiling: f64 },
    #[error("at most {max} scenarios can be compared, got {got}")]
    TooManyScenarios { max: usize, got: usize },
    #[error("invalid solver configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_)
            | ApiError::TooManyScenarios { .. }
            | ApiError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            ApiError::Infeasible { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Io(_) | ApiError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_response(self.status(), &self.to_string())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CalculationMode {
    /// Solve for the portfolio needed to fund `annualWithdrawal`.
    #[default]
    #[serde(alias = "fire", alias = "W")]
    Withdrawal,
    /// Solve for the withdrawal `portfolio` can sustain.
    #[serde(alias = "expense", alias = "P")]
    Portfolio,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalculatePayload {
    #[serde(default)]
    mode: CalculationMode,
    #[serde(flatten)]
    plan: PlanPayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScenarioPayload {
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(flatten)]
    plan: PlanPayload,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ComparePayload {
    scenarios: Vec<ScenarioPayload>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeResult {
    pub portfolio: f64,
    pub annual_withdrawal: f64,
    pub trace: SimulationTrace,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculateResponse {
    pub mode: CalculationMode,
    pub withdrawal_time: WithdrawalTiming,
    pub horizon_years: u32,
    pub target_final_value: f64,
    /// Required portfolio for the requested withdrawal, when one was given.
    pub fire: Option<ModeResult>,
    /// Sustainable withdrawal for the given portfolio, when one was given.
    pub expense: Option<ModeResult>,
    pub notes: Vec<String>,
}

impl CalculateResponse {
    pub fn primary(&self) -> Option<&ModeResult> {
        match self.mode {
            CalculationMode::Withdrawal => self.fire.as_ref(),
            CalculationMode::Portfolio => self.expense.as_ref(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScenarioResult {
    scenario: usize,
    enabled: bool,
    fire_portfolio: Option<f64>,
    annual_withdrawal: Option<f64>,
    horizon_years: Option<u32>,
    trace: Option<SimulationTrace>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompareResponse {
    scenarios: Vec<ScenarioResult>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Clone, Copy, Debug)]
struct AppState {
    solver: SolverConfig,
}

/// Solves the requested mode and, when the other input is present, its counterpart.
/// Only an infeasible primary solve is an error.
pub fn calculate(
    mode: CalculationMode,
    payload: &PlanPayload,
    config: &SolverConfig,
) -> Result<CalculateResponse, ApiError> {
    let plan = build_plan(payload)?;
    let mut notes = Vec::new();

    let fire_input = match mode {
        CalculationMode::Withdrawal => Some(required_withdrawal(payload)?),
        CalculationMode::Portfolio => payload
            .annual_withdrawal
            .map(|_| required_withdrawal(payload))
            .transpose()?,
    };
    let expense_input = match mode {
        CalculationMode::Portfolio => Some(required_portfolio(payload)?),
        CalculationMode::Withdrawal => payload
            .portfolio
            .map(|_| required_portfolio(payload))
            .transpose()?,
    };

    let fire = match fire_input {
        Some(withdrawal) => match solve_fire(&plan, withdrawal, config) {
            Ok(result) => Some(result),
            Err(err) if mode == CalculationMode::Withdrawal => return Err(err),
            Err(err) => {
                notes.push(err.to_string());
                None
            }
        },
        None => None,
    };
    let expense = expense_input.map(|portfolio| solve_expense(&plan, portfolio, config));

    Ok(CalculateResponse {
        mode,
        withdrawal_time: plan.timing,
        horizon_years: plan.horizon_years(),
        target_final_value: plan.target_final_value,
        fire,
        expense,
        notes,
    })
}

fn solve_fire(plan: &Plan, withdrawal: f64, config: &SolverConfig) -> Result<ModeResult, ApiError> {
    let portfolio = find_required_portfolio(
        withdrawal,
        plan.timing,
        &plan.schedule,
        plan.target_final_value,
        &plan.events,
        config,
    );
    if !portfolio.is_finite() {
        warn!(withdrawal, horizon = plan.horizon_years(), "no feasible portfolio");
        return Err(ApiError::Infeasible {
            ceiling: config.portfolio_ceiling,
        });
    }
    let trace = simulate(portfolio, withdrawal, plan.timing, &plan.schedule, &plan.events);
    Ok(ModeResult {
        portfolio,
        annual_withdrawal: withdrawal,
        trace,
    })
}

fn solve_expense(plan: &Plan, portfolio: f64, config: &SolverConfig) -> ModeResult {
    let withdrawal = find_max_annual_expense(
        portfolio,
        plan.timing,
        &plan.schedule,
        plan.target_final_value,
        &plan.events,
        config,
    );
    let trace = simulate(portfolio, withdrawal, plan.timing, &plan.schedule, &plan.events);
    ModeResult {
        portfolio,
        annual_withdrawal: withdrawal,
        trace,
    }
}

fn compare_scenarios(
    scenarios: &[ScenarioPayload],
    config: &SolverConfig,
) -> Result<CompareResponse, ApiError> {
    if scenarios.len() > MAX_SCENARIOS_COMPARE {
        return Err(ApiError::TooManyScenarios {
            max: MAX_SCENARIOS_COMPARE,
            got: scenarios.len(),
        });
    }

    let results = scenarios
        .iter()
        .enumerate()
        .map(|(idx, scenario)| {
            let mut result = ScenarioResult {
                scenario: idx + 1,
                enabled: scenario.enabled,
                fire_portfolio: None,
                annual_withdrawal: None,
                horizon_years: None,
                trace: None,
                error: None,
            };
            if !scenario.enabled {
                return result;
            }
            let solved = build_plan(&scenario.plan)
                .map_err(ApiError::from)
                .and_then(|plan| {
                    let withdrawal = required_withdrawal(&scenario.plan)?;
                    let fire = solve_fire(&plan, withdrawal, config)?;
                    Ok((plan.horizon_years(), fire))
                });
            match solved {
                Ok((horizon, fire)) => {
                    result.fire_portfolio = Some(fire.portfolio);
                    result.annual_withdrawal = Some(fire.annual_withdrawal);
                    result.horizon_years = Some(horizon);
                    result.trace = Some(fire.trace);
                }
                Err(err) => result.error = Some(err.to_string()),
            }
            result
        })
        .collect();

    Ok(CompareResponse { scenarios: results })
}

/// One row per year `0..=T`; the final row has no withdrawal.
pub fn trace_to_csv(trace: &SimulationTrace) -> String {
    let mut csv = String::from("year,balance,withdrawal\n");
    for (idx, (year, balance)) in trace.years.iter().zip(&trace.balances).enumerate() {
        match trace.withdrawals.get(idx) {
            Some(withdrawal) => csv.push_str(&format!("{year},{balance:.2},{withdrawal:.2}\n")),
            None => csv.push_str(&format!("{year},{balance:.2},\n")),
        }
    }
    csv
}

pub async fn run_http_server(port: u16, solver: SolverConfig) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, ?solver, "FIRE calculator API listening");
    println!("Local access: http://127.0.0.1:{port}/");

    axum::serve(listener, router(solver)).await
}

fn router(solver: SolverConfig) -> Router {
    Router::new()
        .route("/api/calculate", post(calculate_handler))
        .route("/api/compare", post(compare_handler))
        .route("/api/export", post(export_handler))
        .fallback(not_found_handler)
        .with_state(AppState { solver })
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn calculate_handler(
    State(state): State<AppState>,
    Json(payload): Json<CalculatePayload>,
) -> Result<Response, ApiError> {
    info!(mode = ?payload.mode, "calculate request");
    let response = calculate(payload.mode, &payload.plan, &state.solver)?;
    Ok(json_response(StatusCode::OK, response))
}

async fn compare_handler(
    State(state): State<AppState>,
    Json(payload): Json<ComparePayload>,
) -> Result<Response, ApiError> {
    info!(scenarios = payload.scenarios.len(), "compare request");
    let response = compare_scenarios(&payload.scenarios, &state.solver)?;
    Ok(json_response(StatusCode::OK, response))
}

async fn export_handler(
    State(state): State<AppState>,
    Json(payload): Json<CalculatePayload>,
) -> Result<Response, ApiError> {
    info!(mode = ?payload.mode, "export request");
    let response = calculate(payload.mode, &payload.plan, &state.solver)?;
    let csv = response.primary().map(|r| trace_to_csv(&r.trace)).unwrap_or_default();
    Ok(with_cache_control((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"fire_simulation.csv\"",
            ),
        ],
        csv,
    )))
}

fn with_cache_control<R: IntoResponse>(response: R) -> Response {
    let mut response = response.into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    with_cache_control((status, Json(body)))
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    const EPS: f64 = 1e-6;

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn calculate_payload(json: &str) -> CalculatePayload {
        serde_json::from_str(json).expect("payload should parse")
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        serde_json::from_slice(&bytes).expect("body should be JSON")
    }

    fn state() -> State<AppState> {
        State(AppState {
            solver: SolverConfig::default(),
        })
    }

    #[test]
    fn withdrawal_mode_solves_fire_number_and_counterpart() {
        let payload = calculate_payload(
            r#"{
              "mode": "withdrawal",
              "withdrawalTime": "end",
              "annualWithdrawal": 40000,
              "portfolio": 1000000,
              "returnRate": 7,
              "inflationRate": 3,
              "years": 25
            }"#,
        );
        let response =
            calculate(payload.mode, &payload.plan, &SolverConfig::default()).expect("solves");

        let fire = response.fire.as_ref().expect("fire result");
        assert_approx_tol(fire.portfolio, 614_223.138_547, 0.02);
        assert_eq!(fire.trace.years.len(), 26);
        assert_approx_tol(fire.trace.final_balance(), 0.0, 0.1);

        let expense = response.expense.as_ref().expect("expense result");
        assert_approx_tol(expense.portfolio, 1_000_000.0, EPS);
        assert!(expense.annual_withdrawal > 40_000.0);
        assert!(response.notes.is_empty());
        assert_eq!(response.horizon_years, 25);
    }

    #[test]
    fn portfolio_mode_requires_portfolio() {
        let payload = calculate_payload(
            r#"{"mode": "portfolio", "annualWithdrawal": 1000, "returnRate": 5, "inflationRate": 2, "years": 10}"#,
        );
        let err = calculate(payload.mode, &payload.plan, &SolverConfig::default())
            .expect_err("portfolio missing");
        assert!(matches!(err, ApiError::InvalidRequest(RequestError::Missing { .. })));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn infeasible_counterpart_becomes_a_note() {
        let payload = calculate_payload(
            r#"{
              "mode": "portfolio",
              "portfolio": 500000,
              "annualWithdrawal": 100000000,
              "returnRate": 1,
              "inflationRate": 0,
              "years": 50
            }"#,
        );
        let response =
            calculate(payload.mode, &payload.plan, &SolverConfig::default()).expect("solves");

        assert!(response.fire.is_none());
        assert_eq!(response.notes.len(), 1);
        assert!(response.primary().is_some());
    }

    #[test]
    fn csv_has_one_row_per_year_and_blank_final_withdrawal() {
        let trace = SimulationTrace {
            years: vec![0, 1, 2],
            balances: vec![100_000.0, 104_000.0, 109_220.0],
            withdrawals: vec![1_000.0, 1_020.0],
        };
        assert_eq!(
            trace_to_csv(&trace),
            "year,balance,withdrawal\n0,100000.00,1000.00\n1,104000.00,1020.00\n2,109220.00,\n"
        );
    }

    #[test]
    fn calculate_response_serializes_camel_case() {
        let payload = calculate_payload(
            r#"{"annualWithdrawal": 20000, "returnRate": 5, "inflationRate": 2, "years": 30}"#,
        );
        let response =
            calculate(payload.mode, &payload.plan, &SolverConfig::default()).expect("solves");
        let json = serde_json::to_string(&response).expect("response should serialize");

        assert!(json.contains("\"mode\":\"withdrawal\""));
        assert!(json.contains("\"withdrawalTime\":\"start\""));
        assert!(json.contains("\"horizonYears\":30"));
        assert!(json.contains("\"annualWithdrawal\""));
        assert!(json.contains("\"balances\""));
        assert!(json.contains("\"expense\":null"));
    }

    #[tokio::test]
    async fn calculate_handler_reports_infeasible_as_unprocessable() {
        let payload = calculate_payload(
            r#"{"withdrawalTime": "end", "annualWithdrawal": 10000000, "returnRate": 1, "inflationRate": 5, "years": 50}"#,
        );
        let err = calculate_handler(state(), Json(payload))
            .await
            .expect_err("must be infeasible");
        let response = err.into_response();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).map(|v| v.as_bytes()),
            Some(&b"no-store"[..])
        );
        let body = body_json(response).await;
        assert!(
            body["error"]
                .as_str()
                .expect("error string")
                .contains("Cannot find a suitable portfolio")
        );
    }

    #[tokio::test]
    async fn calculate_handler_rejects_invalid_horizon() {
        let payload = calculate_payload(
            r#"{"annualWithdrawal": 20000, "returnRate": 5, "inflationRate": 2, "years": -5}"#,
        );
        let response = match calculate_handler(state(), Json(payload)).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        };
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().expect("error string").contains("horizon"));
    }

    #[tokio::test]
    async fn compare_handler_reports_per_scenario_results() {
        let payload: ComparePayload = serde_json::from_str(
            r#"{"scenarios": [
                {"annualWithdrawal": 20000, "returnRate": 5, "inflationRate": 2, "years": 30, "withdrawalTime": "end"},
                {"annualWithdrawal": 25000, "returnRate": 6, "inflationRate": 2.5, "years": 25, "withdrawalTime": "start"},
                {"enabled": false},
                {"annualWithdrawal": 20000, "returnRate": 150, "inflationRate": 2, "years": 30}
            ]}"#,
        )
        .expect("payload should parse");
        let response = compare_handler(state(), Json(payload))
            .await
            .expect("compare succeeds");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let scenarios = body["scenarios"].as_array().expect("scenario list");
        assert_eq!(scenarios.len(), 4);

        assert_eq!(scenarios[0]["enabled"], Value::Bool(true));
        assert!(scenarios[0]["firePortfolio"].as_f64().expect("portfolio") > 0.0);
        assert_eq!(scenarios[0]["trace"]["years"].as_array().map(Vec::len), Some(31));
        assert!(scenarios[1]["error"].is_null());

        assert_eq!(scenarios[2]["enabled"], Value::Bool(false));
        assert!(scenarios[2]["firePortfolio"].is_null());

        assert!(scenarios[3]["error"].as_str().expect("error").contains("returnRate"));
    }

    #[test]
    fn compare_rejects_too_many_scenarios() {
        let scenarios = (0..5)
            .map(|_| ScenarioPayload {
                enabled: false,
                plan: PlanPayload::default(),
            })
            .collect::<Vec<_>>();
        let err = compare_scenarios(&scenarios, &SolverConfig::default()).expect_err("too many");
        assert!(matches!(err, ApiError::TooManyScenarios { max: 4, got: 5 }));
    }

    #[tokio::test]
    async fn export_handler_returns_csv_attachment() {
        let payload = calculate_payload(
            r#"{"mode": "portfolio", "portfolio": 100000, "withdrawalTime": "end",
                "periods": [{"years": 1, "returnRate": 5, "inflationRate": 2}, {"years": 1, "returnRate": 6, "inflationRate": 3}]}"#,
        );
        let response = export_handler(state(), Json(payload))
            .await
            .expect("export succeeds");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).map(|v| v.as_bytes()),
            Some(&b"text/csv; charset=utf-8"[..])
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        let csv = String::from_utf8(bytes.to_vec()).expect("utf-8 csv");
        let lines = csv.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "year,balance,withdrawal");
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("0,100000.00,"));
        assert!(lines[3].starts_with("2,") && lines[3].ends_with(','));
    }

    #[tokio::test]
    async fn unknown_routes_return_json_404() {
        let response = not_found_handler().await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], Value::String("Not found".to_string()));
    }
}
