use serde::Deserialize;
use thiserror::Error;

use crate::core::{OneOffEvent, RatePeriod, WithdrawalTiming, horizon_years};

pub const MAX_HORIZON_YEARS: u32 = 1_000;
const PERIOD_RATE_RANGE: (f64, f64) = (-100.0, 100.0);
const RETURN_RATE_RANGE: (f64, f64) = (-50.0, 100.0);
const INFLATION_RATE_RANGE: (f64, f64) = (-10.0, 50.0);

#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("{field} is required")]
    Missing { field: String },
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: f64, max: f64 },
    #[error("{field} must be >= {min}")]
    BelowMinimum { field: String, min: f64 },
    #[error("{field} must be a finite number")]
    NonFinite { field: String },
    #[error("time horizon must be greater than 0 years")]
    EmptyHorizon,
    #[error("time horizon must be at most {max} years")]
    HorizonTooLong { max: u32 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiWithdrawalTime {
    #[serde(alias = "beginning", alias = "START")]
    Start,
    #[serde(alias = "END")]
    End,
}

impl From<ApiWithdrawalTime> for WithdrawalTiming {
    fn from(value: ApiWithdrawalTime) -> Self {
        match value {
            ApiWithdrawalTime::Start => WithdrawalTiming::Start,
            ApiWithdrawalTime::End => WithdrawalTiming::End,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodPayload {
    pub years: i64,
    pub return_rate: f64,
    pub inflation_rate: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneOffPayload {
    pub year: i64,
    pub amount: f64,
    #[serde(default)]
    pub description: Option<String>,
}

/// Plan inputs as they arrive from a client. Rates are percentages.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlanPayload {
    pub withdrawal_time: Option<ApiWithdrawalTime>,
    #[serde(alias = "W")]
    pub annual_withdrawal: Option<f64>,
    #[serde(alias = "P")]
    pub portfolio: Option<f64>,
    pub target_final_value: Option<f64>,

    #[serde(alias = "r")]
    pub return_rate: Option<f64>,
    #[serde(alias = "i")]
    pub inflation_rate: Option<f64>,
    #[serde(alias = "T")]
    pub years: Option<i64>,
    pub periods: Option<Vec<PeriodPayload>>,

    pub one_offs: Vec<OneOffPayload>,
    pub large_expenses: Vec<OneOffPayload>,
    pub large_incomes: Vec<OneOffPayload>,
}

/// Validated engine inputs shared by every calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub timing: WithdrawalTiming,
    pub schedule: Vec<RatePeriod>,
    pub events: Vec<OneOffEvent>,
    pub target_final_value: f64,
}

impl Plan {
    pub fn horizon_years(&self) -> u32 {
        horizon_years(&self.schedule)
    }
}

pub fn build_plan(payload: &PlanPayload) -> Result<Plan, RequestError> {
    let timing = payload
        .withdrawal_time
        .unwrap_or(ApiWithdrawalTime::Start)
        .into();

    let schedule = match &payload.periods {
        Some(periods) if !periods.is_empty() => periods
            .iter()
            .enumerate()
            .map(|(idx, period)| build_period(idx, period))
            .collect::<Result<Vec<_>, _>>()?,
        _ => vec![single_rate_period(payload)?],
    };
    match total_years(&schedule) {
        Some(0) => return Err(RequestError::EmptyHorizon),
        Some(years) if years <= MAX_HORIZON_YEARS => {}
        _ => {
            return Err(RequestError::HorizonTooLong {
                max: MAX_HORIZON_YEARS,
            });
        }
    }

    let target_final_value = match payload.target_final_value {
        Some(v) => non_negative("targetFinalValue", v)?,
        None => 0.0,
    };

    let mut events = Vec::with_capacity(
        payload.one_offs.len() + payload.large_expenses.len() + payload.large_incomes.len(),
    );
    for (idx, entry) in payload.one_offs.iter().enumerate() {
        let year = event_year(&format!("oneOffs[{idx}].year"), entry.year)?;
        let amount = finite(&format!("oneOffs[{idx}].amount"), entry.amount)?;
        events.push(OneOffEvent::new(year, amount));
    }
    for (idx, entry) in payload.large_expenses.iter().enumerate() {
        let year = event_year(&format!("largeExpenses[{idx}].year"), entry.year)?;
        let amount = non_negative(&format!("largeExpenses[{idx}].amount"), entry.amount)?;
        events.push(OneOffEvent::new(year, -amount));
    }
    for (idx, entry) in payload.large_incomes.iter().enumerate() {
        let year = event_year(&format!("largeIncomes[{idx}].year"), entry.year)?;
        let amount = non_negative(&format!("largeIncomes[{idx}].amount"), entry.amount)?;
        events.push(OneOffEvent::new(year, amount));
    }

    Ok(Plan {
        timing,
        schedule,
        events,
        target_final_value,
    })
}

pub fn required_withdrawal(payload: &PlanPayload) -> Result<f64, RequestError> {
    let value = payload.annual_withdrawal.ok_or_else(|| RequestError::Missing {
        field: "annualWithdrawal".to_string(),
    })?;
    non_negative("annualWithdrawal", value)
}

pub fn required_portfolio(payload: &PlanPayload) -> Result<f64, RequestError> {
    let value = payload.portfolio.ok_or_else(|| RequestError::Missing {
        field: "portfolio".to_string(),
    })?;
    non_negative("portfolio", value)
}

fn build_period(idx: usize, period: &PeriodPayload) -> Result<RatePeriod, RequestError> {
    let duration = positive_years(&format!("periods[{idx}].years"), period.years)?;
    let nominal_return = percent_in_range(
        &format!("periods[{idx}].returnRate"),
        period.return_rate,
        PERIOD_RATE_RANGE,
    )?;
    let inflation = percent_in_range(
        &format!("periods[{idx}].inflationRate"),
        period.inflation_rate,
        PERIOD_RATE_RANGE,
    )?;
    Ok(RatePeriod::new(duration, nominal_return, inflation))
}

fn single_rate_period(payload: &PlanPayload) -> Result<RatePeriod, RequestError> {
    let years = payload.years.ok_or_else(|| RequestError::Missing {
        field: "years".to_string(),
    })?;
    if years <= 0 {
        return Err(RequestError::EmptyHorizon);
    }
    let return_rate = payload.return_rate.ok_or_else(|| RequestError::Missing {
        field: "returnRate".to_string(),
    })?;
    let inflation_rate = payload.inflation_rate.ok_or_else(|| RequestError::Missing {
        field: "inflationRate".to_string(),
    })?;

    Ok(RatePeriod::new(
        positive_years("years", years)?,
        percent_in_range("returnRate", return_rate, RETURN_RATE_RANGE)?,
        percent_in_range("inflationRate", inflation_rate, INFLATION_RATE_RANGE)?,
    ))
}

fn total_years(schedule: &[RatePeriod]) -> Option<u32> {
    schedule
        .iter()
        .try_fold(0u32, |acc, p| acc.checked_add(p.duration_years))
}

fn positive_years(field: &str, years: i64) -> Result<u32, RequestError> {
    if years < 1 {
        return Err(RequestError::BelowMinimum {
            field: field.to_string(),
            min: 1.0,
        });
    }
    u32::try_from(years).map_err(|_| RequestError::OutOfRange {
        field: field.to_string(),
        min: 1.0,
        max: u32::MAX as f64,
    })
}

fn event_year(field: &str, year: i64) -> Result<u32, RequestError> {
    u32::try_from(year).map_err(|_| RequestError::OutOfRange {
        field: field.to_string(),
        min: 0.0,
        max: u32::MAX as f64,
    })
}

fn percent_in_range(
    field: &str,
    percent: f64,
    (min, max): (f64, f64),
) -> Result<f64, RequestError> {
    let percent = finite(field, percent)?;
    if !(min..=max).contains(&percent) {
        return Err(RequestError::OutOfRange {
            field: field.to_string(),
            min,
            max,
        });
    }
    Ok(percent / 100.0)
}

fn non_negative(field: &str, value: f64) -> Result<f64, RequestError> {
    let value = finite(field, value)?;
    if value < 0.0 {
        return Err(RequestError::BelowMinimum {
            field: field.to_string(),
            min: 0.0,
        });
    }
    Ok(value)
}

fn finite(field: &str, value: f64) -> Result<f64, RequestError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RequestError::NonFinite {
            field: field.to_string(),
        })
    }
}
