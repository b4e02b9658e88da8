//! Fuente de tiempo inyectable. Las stages nunca llaman `Utc::now()` directo
//! para que el gating de runtime sea testeable con tiempo virtual.
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Mutex;
use std::time::Duration;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Reloj manual para tests y simulaciones.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        if let Ok(mut g) = self.now.lock() {
            *g = t;
        }
    }

    pub fn advance(&self, d: Duration) {
        if let Ok(mut g) = self.now.lock() {
            *g += to_chrono(d);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|g| *g).unwrap_or_else(|p| *p.into_inner())
    }
}

/// Tope de la conversión; un delay mayor no tiene sentido para la cola.
const MAX_DELAY_DAYS: i64 = 365 * 100;

/// Conversión saturada `std::time::Duration` -> `chrono::Duration`.
pub fn to_chrono(d: Duration) -> ChronoDuration {
    let cap = ChronoDuration::days(MAX_DELAY_DAYS);
    ChronoDuration::from_std(d).map(|c| c.min(cap)).unwrap_or(cap)
}

/// Tiempo transcurrido entre `since` y `now`, 0 si `since` es futuro.
pub fn elapsed_between(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}
