//! Wraps a forge call with the §5 retry shape: 3 attempts, 1 -> 2 -> 4s
//! exponential backoff, used for PR-validation fetches.

use foreman_retry::{calculate_delay, RetryStrategyConfig};

use crate::ForgeError;

pub fn with_forge_retry<T>(mut f: impl FnMut() -> Result<T, ForgeError>) -> Result<T, ForgeError> {
    let config = RetryStrategyConfig::forge_api();
    let mut last_err = None;
    for attempt in 1..=config.max_attempts {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = Some(e);
                if attempt < config.max_attempts {
                    std::thread::sleep(calculate_delay(&config, attempt));
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ForgeError::Request("retry loop produced no attempts".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retries_until_success() {
        let attempts = Cell::new(0);
        let result: Result<i32, ForgeError> = with_forge_retry(|| {
            let n = attempts.get() + 1;
            attempts.set(n);
            if n < 3 {
                Err(ForgeError::Request("transient".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let attempts = Cell::new(0);
        let result: Result<i32, ForgeError> = with_forge_retry(|| {
            attempts.set(attempts.get() + 1);
            Err(ForgeError::Request("always fails".into()))
        });
        assert!(result.is_err());
        assert_eq!(attempts.get(), 3);
    }
}
