//! Five-field cron evaluation: parse, compute the next wall-clock match, and
//! arm a one-shot timer per service that fires `CronFired` into the Supervisor.
use std::{
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, SystemTime},
};

use chrono::{Local, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tracing::warn;

use crate::{config::CronSpec, error::ProcessManagerError, supervisor::SupervisorEvent};

#[derive(Clone, Copy, Debug)]
enum EffectiveTimezone {
    Local,
    Utc,
    Named(Tz),
}

/// Prepends a `0` seconds field to a 5-field expression so the `cron` crate's
/// 6-field parser accepts it.
fn normalize(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

fn resolve_timezone(spec: &CronSpec) -> Result<EffectiveTimezone, ProcessManagerError> {
    match spec.timezone.as_deref().map(str::trim) {
        None | Some("") => Ok(EffectiveTimezone::Local),
        Some(tz) if tz.eq_ignore_ascii_case("utc") => Ok(EffectiveTimezone::Utc),
        Some(tz) if tz.eq_ignore_ascii_case("local") => Ok(EffectiveTimezone::Local),
        Some(tz) => tz
            .parse::<Tz>()
            .map(EffectiveTimezone::Named)
            .map_err(|_| ProcessManagerError::InvalidSpec(format!("invalid timezone '{tz}'"))),
    }
}

fn next_match(schedule: &Schedule, tz: EffectiveTimezone) -> Option<SystemTime> {
    match tz {
        EffectiveTimezone::Local => schedule.upcoming(Local).next().map(Into::into),
        EffectiveTimezone::Utc => schedule.upcoming(Utc).next().map(Into::into),
        EffectiveTimezone::Named(tz) => schedule.upcoming(tz).next().map(Into::into),
    }
}

/// Parses a 5-field cron expression, returning an error for anything the
/// `cron` crate cannot normalize into a valid schedule.
pub fn parse(expression: &str) -> Result<Schedule, ProcessManagerError> {
    Schedule::from_str(&normalize(expression))
        .map_err(|err| ProcessManagerError::InvalidSpec(format!("invalid cron expression: {err}")))
}

/// One-shot timer for a single service's cron schedule.
pub struct CronTimer {
    stop: Arc<AtomicBool>,
}

impl CronTimer {
    pub fn spawn(
        id: u64,
        spec: CronSpec,
        events: std::sync::mpsc::Sender<SupervisorEvent>,
    ) -> Result<Self, ProcessManagerError> {
        let schedule = parse(&spec.expression)?;
        let tz = resolve_timezone(&spec)?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);

        thread::spawn(move || {
            loop {
                if stop_clone.load(Ordering::SeqCst) {
                    return;
                }

                let Some(fire_at) = next_match(&schedule, tz) else {
                    warn!("cron schedule for entry {id} has no upcoming match; stopping timer");
                    return;
                };

                let now = SystemTime::now();
                let wait = match fire_at.duration_since(now) {
                    Ok(duration) => duration,
                    // Clock jumped backward past this match: skip it silently
                    // rather than firing repeatedly for stale occurrences.
                    Err(_) => {
                        warn!("cron match for entry {id} already in the past, skipping");
                        Duration::from_millis(100)
                    }
                };

                let mut slept = Duration::ZERO;
                while slept < wait {
                    if stop_clone.load(Ordering::SeqCst) {
                        return;
                    }
                    let step = Duration::from_millis(200).min(wait - slept);
                    thread::sleep(step);
                    slept += step;
                }

                if stop_clone.load(Ordering::SeqCst) {
                    return;
                }

                if wait > Duration::from_millis(100) {
                    let _ = events.send(SupervisorEvent::CronFired { id });
                }
            }
        });

        Ok(Self { stop })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for CronTimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_prepends_seconds_field_for_five_field_expressions() {
        assert_eq!(normalize("0 * * * *"), "0 0 * * * *");
        assert_eq!(normalize("*/5 * * * *"), "0 */5 * * * *");
    }

    #[test]
    fn parse_accepts_standard_five_field_expression() {
        assert!(parse("0 * * * *").is_ok());
        assert!(parse("*/15 9-17 * * 1-5").is_ok());
    }

    #[test]
    fn parse_rejects_malformed_expression() {
        assert!(parse("not a cron expression").is_err());
    }

    #[test]
    fn resolve_timezone_defaults_to_local() {
        let spec = CronSpec {
            expression: "0 * * * *".to_string(),
            timezone: None,
        };
        assert!(matches!(
            resolve_timezone(&spec).unwrap(),
            EffectiveTimezone::Local
        ));
    }

    #[test]
    fn resolve_timezone_accepts_named_iana_zone() {
        let spec = CronSpec {
            expression: "0 * * * *".to_string(),
            timezone: Some("America/New_York".to_string()),
        };
        assert!(matches!(
            resolve_timezone(&spec).unwrap(),
            EffectiveTimezone::Named(_)
        ));
    }

    #[test]
    fn resolve_timezone_rejects_unknown_zone() {
        let spec = CronSpec {
            expression: "0 * * * *".to_string(),
            timezone: Some("Not/AZone".to_string()),
        };
        assert!(resolve_timezone(&spec).is_err());
    }
}
