//! Device filter strings
//!
//! A selector is a comma-separated list of terms. Each term has up to three
//! colon-separated fields, in order `backend:device_type:device_num`; any
//! field may be left out or written as `*`. The empty selector matches every
//! device.
//!
//! ```text
//! host:gpu:1     host:cpu     gpu     1     host:*:0     cpu,gpu
//! ```

use super::{DeviceInfo, DeviceType};
use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct FilterTerm {
    backend: Option<String>,
    device_type: Option<DeviceType>,
    index: Option<usize>,
}

impl FilterTerm {
    fn matches(&self, device: &DeviceInfo) -> bool {
        self.backend.as_deref().is_none_or(|b| b == device.backend)
            && self.device_type.is_none_or(|t| t == device.device_type)
            && self.index.is_none_or(|i| i == device.index)
    }
}

/// Parsed selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    source: String,
    terms: Vec<FilterTerm>,
}

impl DeviceFilter {
    pub fn parse(selector: &str) -> Result<Self> {
        let source = selector.trim().to_string();
        let invalid = |reason: String| RuntimeError::InvalidSelector {
            selector: source.clone(),
            reason,
        };

        if source.is_empty() {
            return Ok(Self {
                source,
                terms: Vec::new(),
            });
        }

        let mut terms = Vec::new();
        for raw in source.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(invalid("empty filter term".to_string()));
            }

            let mut term = FilterTerm::default();
            // Next field position: 0 = backend, 1 = type, 2 = number
            let mut position = 0;
            for field in raw.split(':') {
                if position > 2 {
                    return Err(invalid(format!("too many fields in `{}`", raw)));
                }
                if field == "*" {
                    position += 1;
                } else if let Some(device_type) = DeviceType::parse(field) {
                    if position > 1 {
                        return Err(invalid(format!("device type `{}` out of order", field)));
                    }
                    term.device_type = Some(device_type);
                    position = 2;
                } else if !field.is_empty() && field.bytes().all(|b| b.is_ascii_digit()) {
                    let index = field
                        .parse()
                        .map_err(|_| invalid(format!("device number `{}` too large", field)))?;
                    term.index = Some(index);
                    position = 3;
                } else if position == 0
                    && !field.is_empty()
                    && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    term.backend = Some(field.to_string());
                    position = 1;
                } else {
                    return Err(invalid(format!("unrecognized field `{}`", field)));
                }
            }
            terms.push(term);
        }

        Ok(Self { source, terms })
    }

    pub fn matches(&self, device: &DeviceInfo) -> bool {
        self.terms.is_empty() || self.terms.iter().any(|t| t.matches(device))
    }

    /// Best matching device: highest type score, then lowest index
    pub fn select<'a>(&self, devices: &'a [DeviceInfo]) -> Option<&'a DeviceInfo> {
        devices
            .iter()
            .filter(|d| self.matches(d))
            .min_by_key(|d| (std::cmp::Reverse(d.device_type.score()), d.index))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Resolve a selector against a device list
pub fn select_device(selector: &str, devices: &[DeviceInfo]) -> Result<DeviceInfo> {
    let filter = DeviceFilter::parse(selector)?;
    filter
        .select(devices)
        .cloned()
        .ok_or_else(|| RuntimeError::DeviceNotFound {
            selector: selector.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices() -> Vec<DeviceInfo> {
        vec![DeviceInfo::host_cpu(0), DeviceInfo::simulated_gpu(1)]
    }

    #[test]
    fn test_empty_selects_best() {
        let d = select_device("", &devices()).unwrap();
        assert_eq!(d.device_type, DeviceType::Gpu);
    }

    #[test]
    fn test_full_selector() {
        let d = select_device("host:cpu:0", &devices()).unwrap();
        assert_eq!(d.index, 0);
        let d = select_device("host:gpu:1", &devices()).unwrap();
        assert_eq!(d.index, 1);
    }

    #[test]
    fn test_partial_selectors() {
        assert_eq!(select_device("cpu", &devices()).unwrap().index, 0);
        assert_eq!(select_device("1", &devices()).unwrap().index, 1);
        assert_eq!(select_device("host:*:0", &devices()).unwrap().index, 0);
        assert_eq!(select_device("host", &devices()).unwrap().index, 1);
    }

    #[test]
    fn test_alternatives() {
        assert_eq!(select_device("cuda,cpu", &devices()).unwrap().index, 0);
    }

    #[test]
    fn test_no_match() {
        assert_eq!(
            select_device("cuda:gpu", &devices()),
            Err(RuntimeError::DeviceNotFound {
                selector: "cuda:gpu".to_string()
            })
        );
        assert!(select_device("host:gpu:0", &devices()).is_err());
    }

    #[test]
    fn test_invalid_selectors() {
        for bad in ["cpu:gpu", "0:gpu", "a:b:c:d", "cpu,,gpu", "gp-u"] {
            assert!(
                matches!(
                    DeviceFilter::parse(bad),
                    Err(RuntimeError::InvalidSelector { .. })
                ),
                "{} should be rejected",
                bad
            );
        }
    }
}
