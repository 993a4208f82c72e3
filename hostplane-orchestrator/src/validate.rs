use hostplane_common::{NetworkMode, OrchestratorError, VmSpec};

use crate::store::VmSpecUpdate;

pub const MAX_NAME_LEN: usize = 64;
pub const MIN_RAM_MB: i32 = 128;

fn invalid(msg: impl Into<String>) -> OrchestratorError {
    OrchestratorError::InvalidConfiguration(msg.into())
}

/// VM names end up in file names (`<name>.log`, `<name>.qcow2`), so keep them path-safe.
pub fn validate_name(name: &str) -> Result<(), OrchestratorError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(invalid(format!(
            "VM name must be 1-{} characters",
            MAX_NAME_LEN
        )));
    }
    if name.starts_with('.') {
        return Err(invalid("VM name must not start with '.'"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid(format!(
            "VM name '{}' may only contain letters, digits, '.', '_' and '-'",
            name
        )));
    }
    Ok(())
}

fn validate_hardware(cpu_cores: i32, ram_mb: i32) -> Result<(), OrchestratorError> {
    if cpu_cores < 1 {
        return Err(invalid("cpu_cores must be at least 1"));
    }
    if ram_mb < MIN_RAM_MB {
        return Err(invalid(format!("ram_mb must be at least {}", MIN_RAM_MB)));
    }
    Ok(())
}

fn validate_network(mode: NetworkMode, bridge: Option<&str>) -> Result<(), OrchestratorError> {
    if mode == NetworkMode::Bridged && bridge.map_or(true, |b| b.trim().is_empty()) {
        return Err(invalid("bridged networking requires a bridge name"));
    }
    Ok(())
}

pub fn validate_spec(spec: &VmSpec) -> Result<(), OrchestratorError> {
    validate_name(&spec.name)?;
    validate_hardware(spec.cpu_cores, spec.ram_mb)?;

    let has_path = spec.disk_path.as_deref().is_some_and(|p| !p.trim().is_empty());
    match spec.disk_size_gb {
        Some(size) if size < 1 => return Err(invalid("disk_size_gb must be at least 1")),
        Some(_) if has_path => {
            return Err(invalid(
                "give either disk_size_gb (new image) or disk_path (existing image), not both",
            ))
        }
        _ => {}
    }

    validate_network(spec.network_mode, spec.bridge_name.as_deref())
}

pub fn validate_update(update: &VmSpecUpdate) -> Result<(), OrchestratorError> {
    validate_hardware(update.cpu_cores, update.ram_mb)?;
    validate_network(update.network_mode, update.bridge_name.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VmSpec {
        serde_json::from_value(serde_json::json!({
            "name": "t1", "cpu_cores": 2, "ram_mb": 1024, "disk_size_gb": 10
        }))
        .unwrap()
    }

    #[test]
    fn names() {
        for ok in ["t1", "web-01", "db_primary.v2", "A"] {
            assert!(validate_name(ok).is_ok(), "{}", ok);
        }
        let long = "x".repeat(65);
        for bad in ["", ".hidden", "a/b", "../x", "has space", long.as_str()] {
            assert!(validate_name(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn spec_rules() {
        assert!(validate_spec(&spec()).is_ok());

        let mut s = spec();
        s.cpu_cores = 0;
        assert!(validate_spec(&s).is_err());

        let mut s = spec();
        s.ram_mb = 64;
        assert!(validate_spec(&s).is_err());

        let mut s = spec();
        s.disk_size_gb = Some(0);
        assert!(validate_spec(&s).is_err());

        let mut s = spec();
        s.disk_path = Some("/images/existing.qcow2".into());
        assert!(validate_spec(&s).is_err());

        let mut s = spec();
        s.network_mode = NetworkMode::Bridged;
        assert!(validate_spec(&s).is_err());
        s.bridge_name = Some("br0".into());
        assert!(validate_spec(&s).is_ok());
    }
}
