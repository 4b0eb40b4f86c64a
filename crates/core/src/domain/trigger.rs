use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TriggerType {
    #[serde(rename = "delta")]
    Delta,
    #[serde(rename = "datetime")]
    Datetime,
    #[serde(rename = "HTTPListener")]
    HttpListener,
    #[serde(rename = "MSFListener")]
    MsfListener,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delta => "delta",
            Self::Datetime => "datetime",
            Self::HttpListener => "HTTPListener",
            Self::MsfListener => "MSFListener",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "delta" => Some(Self::Delta),
            "datetime" => Some(Self::Datetime),
            "HTTPListener" => Some(Self::HttpListener),
            "MSFListener" => Some(Self::MsfListener),
            _ => None,
        }
    }

    /// Triggers armed on the worker rather than on the hive scheduler.
    pub fn is_worker_hosted(&self) -> bool {
        matches!(self, Self::HttpListener | Self::MsfListener)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeltaArgs {
    #[serde(default)]
    pub hours: u32,
    #[serde(default)]
    pub minutes: u32,
    #[serde(default)]
    pub seconds: u32,
}

impl DeltaArgs {
    pub fn duration(&self) -> Duration {
        Duration::hours(i64::from(self.hours))
            + Duration::minutes(i64::from(self.minutes))
            + Duration::seconds(i64::from(self.seconds))
    }
}

/// Absolute start time. Missing date parts default to today in the chosen timezone.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DatetimeArgs {
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub month: Option<u32>,
    #[serde(default)]
    pub day: Option<u32>,
    #[serde(default)]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
    #[serde(default)]
    pub second: u32,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl DatetimeArgs {
    pub fn timezone(&self, default_tz: Tz) -> Result<Tz, String> {
        match &self.timezone {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| format!("unknown timezone '{}'", name)),
            None => Ok(default_tz),
        }
    }

    pub fn resolve(&self, now: DateTime<Utc>, default_tz: Tz) -> Result<DateTime<Utc>, String> {
        let tz = self.timezone(default_tz)?;
        let today = now.with_timezone(&tz).date_naive();

        let date = NaiveDate::from_ymd_opt(
            self.year.unwrap_or(today.year()),
            self.month.unwrap_or(today.month()),
            self.day.unwrap_or(today.day()),
        )
        .ok_or_else(|| "invalid date".to_string())?;
        let time = NaiveTime::from_hms_opt(self.hour, self.minute, self.second)
            .ok_or_else(|| "invalid time of day".to_string())?;

        tz.from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|local| local.with_timezone(&Utc))
            .ok_or_else(|| "local time does not exist in timezone".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpParameter {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpRoute {
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub parameters: Vec<HttpParameter>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpListenerArgs {
    pub host: String,
    pub port: u16,
    pub routes: Vec<HttpRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MsfListenerArgs {
    pub identifiers: Map<String, Value>,
}

/// Typed view over a stage's `trigger_args`.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerSpec {
    Delta(DeltaArgs),
    Datetime(DatetimeArgs),
    HttpListener(HttpListenerArgs),
    MsfListener(MsfListenerArgs),
}

impl TriggerSpec {
    pub fn parse(
        stage: &str,
        trigger_type: TriggerType,
        args: &Value,
    ) -> Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidTriggerArgs {
            stage: stage.to_string(),
            reason,
        };

        match trigger_type {
            TriggerType::Delta => {
                let delta: DeltaArgs =
                    serde_json::from_value(args.clone()).map_err(|e| invalid(e.to_string()))?;
                Ok(Self::Delta(delta))
            }
            TriggerType::Datetime => {
                let dt: DatetimeArgs =
                    serde_json::from_value(args.clone()).map_err(|e| invalid(e.to_string()))?;
                dt.timezone(Tz::UTC).map_err(invalid)?;
                if NaiveTime::from_hms_opt(dt.hour, dt.minute, dt.second).is_none() {
                    return Err(invalid("invalid time of day".to_string()));
                }
                if let (Some(year), Some(month), Some(day)) = (dt.year, dt.month, dt.day) {
                    if NaiveDate::from_ymd_opt(year, month, day).is_none() {
                        return Err(invalid("invalid date".to_string()));
                    }
                }
                Ok(Self::Datetime(dt))
            }
            TriggerType::HttpListener => {
                let http: HttpListenerArgs =
                    serde_json::from_value(args.clone()).map_err(|e| invalid(e.to_string()))?;
                if http.port == 0 {
                    return Err(invalid("port must be non-zero".to_string()));
                }
                if http.routes.is_empty() {
                    return Err(invalid("at least one route is required".to_string()));
                }
                for route in &http.routes {
                    if !route.path.starts_with('/') {
                        return Err(invalid(format!("route path '{}' must start with '/'", route.path)));
                    }
                    if !matches!(route.method.to_uppercase().as_str(), "GET" | "POST") {
                        return Err(invalid(format!("unsupported method '{}'", route.method)));
                    }
                }
                Ok(Self::HttpListener(http))
            }
            TriggerType::MsfListener => {
                let msf: MsfListenerArgs =
                    serde_json::from_value(args.clone()).map_err(|e| invalid(e.to_string()))?;
                if msf.identifiers.is_empty() {
                    return Err(invalid("at least one session identifier is required".to_string()));
                }
                Ok(Self::MsfListener(msf))
            }
        }
    }
}
