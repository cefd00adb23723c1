//! Settings provider and read-through cache.
//!
//! Settings are plain string key/values (VAT rate, withholding presets,
//! scheduler cadence). The engine never reads them from global state: a
//! [`SettingsCache`] is built once at startup and handed to whoever needs it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::engine::tax::{validate_withholding_rate, STANDARD_VAT_RATE};
use crate::error::BillingError;

pub const VAT_RATE_KEY: &str = "tax.vat_rate";
pub const WITHHOLDING_PREFIX: &str = "tax.withholding.";
pub const SWEEP_INTERVAL_KEY: &str = "scheduler.interval_secs";
pub const DUE_DAYS_KEY: &str = "billing.due_days";
pub const FOLLOW_UP_MAX_LEVEL_KEY: &str = "billing.follow_up_max_level";

pub const DEFAULT_DUE_DAYS: i64 = 30;
pub const MAX_DUE_DAYS: i64 = 3650;
pub const DEFAULT_FOLLOW_UP_MAX_LEVEL: i32 = 3;

/// Withholding presets available when the settings store has none.
/// Rates are fractions.
pub const BUILTIN_WITHHOLDING_PRESETS: [(&str, Decimal); 4] = [
    ("WC158", Decimal::from_parts(1, 0, 0, false, 2)),
    ("WC160", Decimal::from_parts(2, 0, 0, false, 2)),
    ("WI010", Decimal::from_parts(5, 0, 0, false, 2)),
    ("WI011", Decimal::from_parts(10, 0, 0, false, 2)),
];

/// Read-only key/value source.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BillingError>;
}

/// Settings held in memory. Used by tests and when no database is configured.
#[derive(Default)]
pub struct StaticSettings {
    values: DashMap<String, String>,
}

impl StaticSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn set(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn get(&self, key: &str) -> Result<Option<String>, BillingError> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }
}

struct CachedValue {
    value: Option<String>,
    fetched_at: Instant,
}

/// TTL read-through cache over a [`SettingsProvider`], with typed accessors.
///
/// Absent keys are cached too, so a missing setting costs one lookup per TTL.
pub struct SettingsCache {
    provider: Arc<dyn SettingsProvider>,
    ttl: Duration,
    entries: DashMap<String, CachedValue>,
}

impl SettingsCache {
    pub fn new(provider: Arc<dyn SettingsProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            entries: DashMap::new(),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, BillingError> {
        if let Some(entry) = self.entries.get(key) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.value.clone());
            }
        }

        let value = self.provider.get(key).await?;
        debug!(key = %key, found = value.is_some(), "Settings cache refreshed");
        self.entries.insert(
            key.to_string(),
            CachedValue {
                value: value.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(value)
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    async fn parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, BillingError> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        match raw.trim().parse::<T>() {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                warn!(key = %key, value = %raw, "Unparseable setting, using default");
                Ok(None)
            }
        }
    }

    /// VAT rate as a fraction.
    pub async fn vat_rate(&self) -> Result<Decimal, BillingError> {
        match self.parsed::<Decimal>(VAT_RATE_KEY).await? {
            Some(rate) if rate >= Decimal::ZERO && rate < Decimal::ONE => Ok(rate),
            Some(rate) => {
                warn!(rate = %rate, "VAT rate out of range, using standard rate");
                Ok(STANDARD_VAT_RATE)
            }
            None => Ok(STANDARD_VAT_RATE),
        }
    }

    /// Withholding rate for a tax code, from settings or the built-in presets.
    pub async fn withholding_preset(&self, code: &str) -> Result<Option<Decimal>, BillingError> {
        let code = code.trim().to_ascii_uppercase();
        let key = format!("{}{}", WITHHOLDING_PREFIX, code);
        if let Some(rate) = self.parsed::<Decimal>(&key).await? {
            validate_withholding_rate(rate)?;
            return Ok(Some(rate));
        }
        Ok(BUILTIN_WITHHOLDING_PRESETS
            .iter()
            .find(|(preset, _)| *preset == code)
            .map(|(_, rate)| *rate))
    }

    /// Sweep cadence override, if configured.
    pub async fn sweep_interval(&self) -> Result<Option<Duration>, BillingError> {
        Ok(self
            .parsed::<u64>(SWEEP_INTERVAL_KEY)
            .await?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs))
    }

    /// Payment term in days, within `0..=MAX_DUE_DAYS`.
    pub async fn invoice_due_days(&self) -> Result<i64, BillingError> {
        match self.parsed::<i64>(DUE_DAYS_KEY).await? {
            Some(days) if (0..=MAX_DUE_DAYS).contains(&days) => Ok(days),
            Some(days) => {
                warn!(key = DUE_DAYS_KEY, days, "Due days out of range, using default");
                Ok(DEFAULT_DUE_DAYS)
            }
            None => Ok(DEFAULT_DUE_DAYS),
        }
    }

    pub async fn follow_up_max_level(&self) -> Result<i32, BillingError> {
        Ok(self
            .parsed::<i32>(FOLLOW_UP_MAX_LEVEL_KEY)
            .await?
            .filter(|level| *level > 0)
            .unwrap_or(DEFAULT_FOLLOW_UP_MAX_LEVEL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Counts lookups so cache hits are observable.
    struct CountingProvider {
        inner: StaticSettings,
        lookups: AtomicU64,
    }

    #[async_trait]
    impl SettingsProvider for CountingProvider {
        async fn get(&self, key: &str) -> Result<Option<String>, BillingError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }
    }

    fn counting(inner: StaticSettings) -> Arc<CountingProvider> {
        Arc::new(CountingProvider {
            inner,
            lookups: AtomicU64::new(0),
        })
    }

    #[tokio::test]
    async fn test_defaults_when_unset() {
        let cache = SettingsCache::new(Arc::new(StaticSettings::new()), Duration::from_secs(60));
        assert_eq!(cache.vat_rate().await.unwrap(), STANDARD_VAT_RATE);
        assert_eq!(cache.invoice_due_days().await.unwrap(), DEFAULT_DUE_DAYS);
        assert_eq!(
            cache.follow_up_max_level().await.unwrap(),
            DEFAULT_FOLLOW_UP_MAX_LEVEL
        );
        assert_eq!(cache.sweep_interval().await.unwrap(), None);
        assert_eq!(
            cache.withholding_preset("wc160").await.unwrap(),
            Some(Decimal::new(2, 2))
        );
        assert_eq!(cache.withholding_preset("XX999").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_settings_override_presets_and_bad_values_fall_back() {
        let settings = StaticSettings::new()
            .with(VAT_RATE_KEY, "0.10")
            .with("tax.withholding.WC160", "0.015")
            .with(DUE_DAYS_KEY, "fifteen")
            .with(SWEEP_INTERVAL_KEY, "3600");
        let cache = SettingsCache::new(Arc::new(settings), Duration::from_secs(60));

        assert_eq!(cache.vat_rate().await.unwrap(), Decimal::new(10, 2));
        assert_eq!(
            cache.withholding_preset("WC160").await.unwrap(),
            Some(Decimal::new(15, 3))
        );
        assert_eq!(cache.invoice_due_days().await.unwrap(), DEFAULT_DUE_DAYS);
        assert_eq!(
            cache.sweep_interval().await.unwrap(),
            Some(Duration::from_secs(3600))
        );
    }

    #[tokio::test]
    async fn test_due_days_outside_range_fall_back() {
        for value in ["-5", "3651", "200000000000000"] {
            let settings = StaticSettings::new().with(DUE_DAYS_KEY, value);
            let cache = SettingsCache::new(Arc::new(settings), Duration::from_secs(60));
            assert_eq!(cache.invoice_due_days().await.unwrap(), DEFAULT_DUE_DAYS);
        }

        let settings = StaticSettings::new().with(DUE_DAYS_KEY, "3650");
        let cache = SettingsCache::new(Arc::new(settings), Duration::from_secs(60));
        assert_eq!(cache.invoice_due_days().await.unwrap(), MAX_DUE_DAYS);
    }

    #[tokio::test]
    async fn test_out_of_range_preset_is_rejected() {
        let settings = StaticSettings::new().with("tax.withholding.WC158", "1.5");
        let cache = SettingsCache::new(Arc::new(settings), Duration::from_secs(60));
        assert!(matches!(
            cache.withholding_preset("WC158").await,
            Err(BillingError::InvalidRate(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_serves_until_invalidated() {
        let provider = counting(StaticSettings::new().with(VAT_RATE_KEY, "0.12"));
        let cache = SettingsCache::new(provider.clone(), Duration::from_secs(300));

        cache.vat_rate().await.unwrap();
        cache.vat_rate().await.unwrap();
        assert_eq!(provider.lookups.load(Ordering::SeqCst), 1);

        provider.inner.set(VAT_RATE_KEY, "0.05");
        assert_eq!(cache.vat_rate().await.unwrap(), Decimal::new(12, 2));

        cache.invalidate(VAT_RATE_KEY);
        assert_eq!(cache.vat_rate().await.unwrap(), Decimal::new(5, 2));
        assert_eq!(provider.lookups.load(Ordering::SeqCst), 2);

        cache.invalidate_all();
        cache.vat_rate().await.unwrap();
        assert_eq!(provider.lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_reads_through() {
        let provider = counting(StaticSettings::new());
        let cache = SettingsCache::new(provider.clone(), Duration::ZERO);
        cache.get("missing").await.unwrap();
        cache.get("missing").await.unwrap();
        assert_eq!(provider.lookups.load(Ordering::SeqCst), 2);
    }
}
