use keeper_core::ExecutionRequest;
use std::time::Duration;

/// Shape checks for execution requests, and log-safe rendering of caller input.
pub struct Sanitizer {
    max_args: usize,
    max_arg_len: usize,
    max_timeout: Duration,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self {
            max_args: 256,
            max_arg_len: 16_384,
            max_timeout: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl Sanitizer {
    pub fn new(max_args: usize, max_arg_len: usize, max_timeout: Duration) -> Self {
        Self {
            max_args,
            max_arg_len,
            max_timeout,
        }
    }

    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }

    /// Reject requests the executor must never see. Returns the reason.
    pub fn check_request(&self, req: &ExecutionRequest) -> Result<(), String> {
        if req.command.trim().is_empty() {
            return Err("empty command".to_string());
        }
        if req.command.chars().any(char::is_control) {
            return Err("command contains control characters".to_string());
        }
        if req.args.len() > self.max_args {
            return Err(format!("too many arguments ({} > {})", req.args.len(), self.max_args));
        }
        for (i, arg) in req.args.iter().enumerate() {
            if arg.contains('\0') {
                return Err(format!("argument {i} contains null bytes"));
            }
            if arg.len() > self.max_arg_len {
                return Err(format!("argument {i} exceeds maximum length"));
            }
        }
        for (key, value) in &req.env {
            check_env_key(key)?;
            if value.contains('\0') {
                return Err(format!("environment value for {key} contains null bytes"));
            }
        }
        for cred in &req.credentials {
            check_env_key(&cred.env_var)?;
            if req.env.contains_key(&cred.env_var) {
                return Err(format!(
                    "credential variable {} collides with plain environment",
                    cred.env_var
                ));
            }
        }
        if req.timeout.is_zero() {
            return Err("timeout must be positive".to_string());
        }
        if req.timeout > self.max_timeout {
            return Err(format!(
                "timeout {}s exceeds maximum {}s",
                req.timeout.as_secs(),
                self.max_timeout.as_secs()
            ));
        }
        Ok(())
    }

    /// Strip control characters so caller input cannot forge log lines.
    pub fn for_log(&self, value: &str) -> String {
        value
            .chars()
            .filter(|c| !c.is_control())
            .take(200)
            .collect()
    }
}

fn check_env_key(key: &str) -> Result<(), String> {
    if key.is_empty() || key.contains('=') || key.contains('\0') {
        return Err(format!("invalid environment variable name {key:?}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_core::{CallerIdentity, CredentialRef};

    fn request(command: &str) -> ExecutionRequest {
        ExecutionRequest::new(CallerIdentity::new("app.ui"), command)
    }

    #[test]
    fn test_clean_request() {
        let s = Sanitizer::default();
        assert!(s.check_request(&request("restic").arg("snapshots")).is_ok());
    }

    #[test]
    fn test_empty_and_control_commands_rejected() {
        let s = Sanitizer::default();
        assert!(s.check_request(&request("  ")).is_err());
        assert!(s.check_request(&request("restic\nrm")).is_err());
    }

    #[test]
    fn test_null_bytes_rejected() {
        let s = Sanitizer::default();
        assert!(s.check_request(&request("restic").arg("a\0b")).is_err());
        assert!(s.check_request(&request("restic").env("A", "x\0")).is_err());
    }

    #[test]
    fn test_timeout_bounds() {
        let s = Sanitizer::new(8, 64, Duration::from_secs(10));
        assert!(s
            .check_request(&request("restic").timeout(Duration::ZERO))
            .is_err());
        assert!(s
            .check_request(&request("restic").timeout(Duration::from_secs(11)))
            .is_err());
    }

    #[test]
    fn test_credential_env_collision() {
        let s = Sanitizer::default();
        let req = request("restic")
            .env("RESTIC_PASSWORD", "plain")
            .credential(CredentialRef::new("repo-1", "RESTIC_PASSWORD"));
        assert!(s.check_request(&req).is_err());
    }

    #[test]
    fn test_for_log_strips_escapes() {
        let s = Sanitizer::default();
        let clean = s.for_log("restic\x1b[31m\nforged");
        assert!(!clean.contains('\x1b'));
        assert!(!clean.contains('\n'));
    }
}
