//! Boot argument resolution (SPEC_FULL.md §4.12): explicit value, then
//! environment variable, then a hard failure — no silent zero-value
//! default for anything identity-bearing.

use crate::error::{NestmeshError, Result};

#[derive(Debug, Clone)]
pub struct BootArgs {
    pub parent_id: u32,
    pub context_id: u32,
    pub key: Vec<u8>,
    pub log_level: tracing::Level,
}

impl BootArgs {
    /// Resolves boot arguments the way `ExternalContext::main` is invoked
    /// positionally by a real bootstrap, but falls back to `NESTMESH_*`
    /// environment variables for stand-alone exercise of the boot path.
    pub fn from_env_or_args(
        parent_id: Option<u32>,
        context_id: Option<u32>,
        key: Option<Vec<u8>>,
        log_level: Option<tracing::Level>,
    ) -> Result<Self> {
        let parent_id = parent_id.or_else(|| env_u32("NESTMESH_PARENT_ID")).ok_or_else(|| {
            NestmeshError::stream(0, "missing parent_id (pass explicitly or set NESTMESH_PARENT_ID)")
        })?;
        let context_id = context_id.or_else(|| env_u32("NESTMESH_CONTEXT_ID")).ok_or_else(|| {
            NestmeshError::stream(0, "missing context_id (pass explicitly or set NESTMESH_CONTEXT_ID)")
        })?;
        let key = key
            .or_else(|| std::env::var("NESTMESH_KEY").ok().map(String::into_bytes))
            .ok_or_else(|| NestmeshError::stream(0, "missing key (pass explicitly or set NESTMESH_KEY)"))?;
        let log_level = log_level
            .or_else(|| std::env::var("NESTMESH_LOG_LEVEL").ok().and_then(|s| s.parse().ok()))
            .unwrap_or(tracing::Level::INFO);

        Ok(Self { parent_id, context_id, key, log_level })
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn explicit_args_take_precedence_over_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("NESTMESH_PARENT_ID", "999");
        let args = BootArgs::from_env_or_args(Some(1), Some(2), Some(vec![0u8; 16]), None).unwrap();
        assert_eq!(args.parent_id, 1);
        std::env::remove_var("NESTMESH_PARENT_ID");
    }

    #[test]
    fn falls_back_to_env_when_arg_missing() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("NESTMESH_PARENT_ID", "7");
        std::env::set_var("NESTMESH_CONTEXT_ID", "8");
        std::env::set_var("NESTMESH_KEY", "0000000000000000");
        let args = BootArgs::from_env_or_args(None, None, None, None).unwrap();
        assert_eq!(args.parent_id, 7);
        assert_eq!(args.context_id, 8);
        std::env::remove_var("NESTMESH_PARENT_ID");
        std::env::remove_var("NESTMESH_CONTEXT_ID");
        std::env::remove_var("NESTMESH_KEY");
    }

    #[test]
    fn missing_everything_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("NESTMESH_PARENT_ID");
        assert!(BootArgs::from_env_or_args(None, Some(1), Some(vec![]), None).is_err());
    }
}
