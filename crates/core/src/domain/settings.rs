use std::time::Duration;

/// Core runtime settings
#[derive(Debug, Clone)]
pub struct CoreSettings {
    /// Job records older than this are expired on every store access
    pub retention_days: u32,
    /// Deadline for a single provider call
    pub job_timeout: Duration,
    /// Quota for plans without a PLAN_<ID>_QUOTA override
    pub default_monthly_quota: u32,
    /// Upper bound on list() page size
    pub list_limit_max: u32,
    pub telemetry_enabled: bool,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            retention_days: 7,
            job_timeout: Duration::from_secs(300),
            default_monthly_quota: 20,
            list_limit_max: 30,
            telemetry_enabled: true,
        }
    }
}

impl CoreSettings {
    /// Settings from the environment, falling back to defaults on
    /// missing or unparsable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            retention_days: env_u32("IMAGE_RETENTION_DAYS").unwrap_or(defaults.retention_days),
            job_timeout: env_u32("JOB_TIMEOUT_SECS")
                .map(|secs| Duration::from_secs(secs.into()))
                .unwrap_or(defaults.job_timeout),
            default_monthly_quota: env_u32("DEFAULT_MONTHLY_QUOTA")
                .unwrap_or(defaults.default_monthly_quota),
            list_limit_max: defaults.list_limit_max,
            telemetry_enabled: std::env::var("TELEMETRY_DISABLED").as_deref() != Ok("1"),
        }
    }

    /// Monthly quota for a plan: PLAN_<ID>_QUOTA env override, else default.
    pub fn quota_for_plan(&self, plan_id: Option<&str>) -> u32 {
        if let Some(plan) = plan_id {
            let key: String = plan
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect();
            if let Some(quota) = env_u32(&format!("PLAN_{key}_QUOTA")) {
                return quota;
            }
        }
        self.default_monthly_quota
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
}
