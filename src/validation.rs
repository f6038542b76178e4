//! Input validation for info submissions.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

use crate::errors::AppError;
use crate::models::{NewUser, SocialHandles};

const ETH_PATTERN: &str = r"(?i)^(0x)?(?P<addr>[0-9a-f]{40})$";
const TELEGRAM_PATTERN: &str = r"(?i)^@?(?P<name>[0-9a-z_]{5,25})$";
// RFC 5322 simplified: local@domain.tld
const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$";

fn pattern(re: &str) -> Result<Regex, AppError> {
    Regex::new(re).map_err(|e| AppError::InternalError(format!("Invalid pattern: {}", e)))
}

/// Lower-cased 40 hex char address without the `0x` prefix.
pub fn to_eth(value: &str) -> Result<String, AppError> {
    pattern(ETH_PATTERN)?
        .captures(value.trim())
        .and_then(|caps| caps.name("addr"))
        .map(|m| m.as_str().to_ascii_lowercase())
        .ok_or_else(|| AppError::BadRequest(format!("Invalid eth address: {}", value)))
}

/// Telegram handle without the leading `@`.
pub fn to_telegram(value: &str) -> Result<String, AppError> {
    pattern(TELEGRAM_PATTERN)?
        .captures(value.trim())
        .and_then(|caps| caps.name("name"))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| AppError::BadRequest(format!("Invalid telegram handle: {}", value)))
}

pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }
    pattern(EMAIL_PATTERN)
        .map(|re| re.is_match(email))
        .unwrap_or(false)
}

/// E.164 form when the number parses and validates for `country_code`,
/// the trimmed input otherwise.
pub fn normalize_phone(raw: &str, country_code: &str) -> String {
    let trimmed = raw.trim();
    let country = country_code.trim().to_ascii_uppercase().parse::<CountryId>().ok();
    match phonenumber::parse(country, trimmed) {
        Ok(number) if phonenumber::is_valid(&number) => {
            number.format().mode(Mode::E164).to_string()
        }
        _ => {
            tracing::debug!("Keeping phone as submitted: {}", trimmed);
            trimmed.to_string()
        }
    }
}

/// Unix seconds as a number or numeric string.
pub fn to_datetime(value: &Value) -> Result<DateTime<Utc>, AppError> {
    let seconds = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    seconds
        .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        .ok_or_else(|| AppError::BadRequest(format!("Invalid timestamp: {}", value)))
}

fn check_length(field: &str, value: &str, min: usize, max: usize) -> Result<(), AppError> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(AppError::BadRequest(format!(
            "{} length must be between {} and {}",
            field, min, max
        )));
    }
    Ok(())
}

fn check_optional(field: &str, value: &Option<String>, max: usize) -> Result<(), AppError> {
    match value {
        Some(v) => check_length(field, v, 0, max),
        None => Ok(()),
    }
}

/// Raw `POST /api/v1/user` body.
#[derive(Debug, Clone, Deserialize)]
pub struct InfoSubmission {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub dob: Value,
    pub address: String,
    pub city: String,
    #[serde(default)]
    pub state_code: Option<String>,
    pub zip_code: String,
    pub country_code: String,
    pub phone: String,
    #[serde(default)]
    pub eth_address: Option<String>,
    #[serde(default)]
    pub eth_amount: Option<f64>,
    #[serde(default)]
    pub telegram: Option<String>,
    pub confirmed_location: bool,
    pub dfp: String,
    #[serde(default)]
    pub medium: Option<String>,
    #[serde(default)]
    pub reddit: Option<String>,
    #[serde(default)]
    pub twitter: Option<String>,
    #[serde(default)]
    pub linkedin: Option<String>,
    #[serde(default)]
    pub facebook: Option<String>,
}

impl InfoSubmission {
    /// Validates and normalizes into a user ready to insert.
    pub fn validate(
        self,
        ip: Option<String>,
        ip_country: Option<String>,
    ) -> Result<NewUser, AppError> {
        check_length("first_name", &self.first_name, 2, 30)?;
        check_length("last_name", &self.last_name, 2, 30)?;
        check_length("address", &self.address, 1, 100)?;
        check_length("city", &self.city, 2, 30)?;
        check_optional("state_code", &self.state_code, 30)?;
        check_length("zip_code", &self.zip_code, 2, 20)?;
        check_length("country_code", &self.country_code, 2, 3)?;
        check_length("phone", &self.phone, 8, 20)?;
        check_length("dfp", &self.dfp, 10, 4096)?;
        for (field, value) in [
            ("medium", &self.medium),
            ("reddit", &self.reddit),
            ("twitter", &self.twitter),
            ("linkedin", &self.linkedin),
            ("facebook", &self.facebook),
        ] {
            check_optional(field, value, 150)?;
        }

        let email = self.email.trim().to_lowercase();
        if !is_valid_email(&email) {
            return Err(AppError::BadRequest(format!("Invalid email: {}", self.email)));
        }
        if !self.confirmed_location {
            return Err(AppError::BadRequest("Unconfirmed location".to_string()));
        }

        let eth_amount = match self.eth_amount {
            Some(amount) if !(0.0..=100.0).contains(&amount) => {
                return Err(AppError::BadRequest(
                    "eth_amount must be between 0 and 100".to_string(),
                ))
            }
            Some(amount) => Some(BigDecimal::from_str(&amount.to_string()).map_err(|e| {
                AppError::BadRequest(format!("Invalid eth_amount: {}", e))
            })?),
            None => None,
        };

        let country_code = self.country_code.trim().to_ascii_uppercase();
        Ok(NewUser {
            email,
            eth_address: self.eth_address.as_deref().map(to_eth).transpose()?,
            eth_amount,
            telegram: self.telegram.as_deref().map(to_telegram).transpose()?,
            first_name: self.first_name,
            last_name: self.last_name,
            dob: Some(to_datetime(&self.dob)?),
            phone: normalize_phone(&self.phone, &country_code),
            address: self.address,
            city: self.city,
            state_code: self.state_code,
            zip_code: self.zip_code,
            country_code: Some(country_code),
            ip,
            ip_country,
            dfp: Some(self.dfp),
            confirmed_location: true,
            socials: SocialHandles {
                medium: self.medium,
                reddit: self.reddit,
                twitter: self.twitter,
                linkedin: self.linkedin,
                facebook: self.facebook,
            },
        })
    }
}
