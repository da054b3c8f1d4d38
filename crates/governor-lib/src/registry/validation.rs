//! Field-level validation of group definitions and the overcommit invariant

use super::store::GroupTable;
use crate::error::{GovernanceError, GovernanceResult};
use crate::models::{GroupDefinition, GroupUpdate, ResourceKind, ResourceLimits};

/// Maximum length of a group name, in characters
pub const MAX_NAME_LENGTH: usize = 50;

/// Characters a group name may not contain
const INVALID_NAME_CHARS: &[char] = &[
    ' ', ',', '"', ':', '*', '+', '/', '\\', '|', '?', '#', '<', '>',
];

/// Tolerance for floating point comparisons on thresholds
const EPSILON: f64 = 1e-9;

pub fn validate_name(name: &str) -> GovernanceResult<()> {
    if name.is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(invalid(format!(
            "name must be at most {} characters",
            MAX_NAME_LENGTH
        )));
    }
    if name.starts_with('-') || name.starts_with('_') {
        return Err(invalid(format!(
            "name '{}' must not start with '-' or '_'",
            name
        )));
    }
    if let Some(c) = name.chars().find(|c| INVALID_NAME_CHARS.contains(c)) {
        return Err(invalid(format!(
            "name '{}' contains invalid character '{}'",
            name, c
        )));
    }
    Ok(())
}

pub fn validate_threshold(kind: ResourceKind, threshold: f64) -> GovernanceResult<()> {
    if !threshold.is_finite() || threshold <= 0.0 || threshold > 1.0 {
        return Err(invalid(format!(
            "{} threshold must be in (0.0, 1.0], got {}",
            kind, threshold
        )));
    }
    let scaled = threshold * 100.0;
    if (scaled - scaled.round()).abs() > EPSILON {
        return Err(invalid(format!(
            "{} threshold {} has more than two decimal digits",
            kind, threshold
        )));
    }
    Ok(())
}

pub fn validate_limits(limits: &ResourceLimits) -> GovernanceResult<()> {
    if limits.is_empty() {
        return Err(invalid("resource_limits must not be empty"));
    }
    for (kind, threshold) in limits {
        validate_threshold(*kind, *threshold)?;
    }
    Ok(())
}

pub fn validate_updated_at(millis: i64, now_millis: i64) -> GovernanceResult<()> {
    if millis < 0 || millis > now_millis {
        return Err(invalid(format!(
            "updated_at_millis {} must be between 0 and {}",
            millis, now_millis
        )));
    }
    Ok(())
}

pub fn validate_definition(def: &GroupDefinition, now_millis: i64) -> GovernanceResult<()> {
    if let Some(id) = &def.id {
        if id.trim().is_empty() {
            return Err(invalid("id must not be blank"));
        }
    }
    validate_name(&def.name)?;
    validate_limits(&def.resource_limits)?;
    if let Some(millis) = def.updated_at_millis {
        validate_updated_at(millis, now_millis)?;
    }
    Ok(())
}

/// Validate only the fields an update actually supplies
pub fn validate_update(update: &GroupUpdate, now_millis: i64) -> GovernanceResult<()> {
    if update.is_empty() {
        return Err(invalid("update does not change any field"));
    }
    if let Some(name) = &update.name {
        validate_name(name)?;
    }
    if let Some(limits) = &update.resource_limits {
        validate_limits(limits)?;
    }
    if let Some(millis) = update.updated_at_millis {
        validate_updated_at(millis, now_millis)?;
    }
    Ok(())
}

/// Check that adding `limits` keeps every kind's cross-group sum at or below 1.0.
///
/// `excluding` names a group whose current limits are replaced by `limits`.
pub fn check_allocation(
    table: &GroupTable,
    limits: &ResourceLimits,
    excluding: Option<&str>,
) -> GovernanceResult<()> {
    for (kind, threshold) in limits {
        let total = table.allocation(*kind, excluding) + threshold;
        if total > 1.0 + EPSILON {
            return Err(GovernanceError::OverAllocated { kind: *kind, total });
        }
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> GovernanceError {
    GovernanceError::InvalidDefinition(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ResiliencyMode, ResourceGroup};

    #[test]
    fn test_valid_names() {
        assert!(validate_name("analytics").is_ok());
        assert!(validate_name("team-a_search.v2").is_ok());
        assert!(validate_name(&"a".repeat(50)).is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name(&"a".repeat(51)).is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("_leading").is_err());
        for bad in [
            "a b", "a,b", "a\"b", "a:b", "a*b", "a+b", "a/b", "a\\b", "a|b", "a?b", "a#b",
            "a<b", "a>b",
        ] {
            assert!(validate_name(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_thresholds() {
        assert!(validate_threshold(ResourceKind::Cpu, 1.0).is_ok());
        assert!(validate_threshold(ResourceKind::Cpu, 0.01).is_ok());
        assert!(validate_threshold(ResourceKind::Cpu, 0.35).is_ok());
        assert!(validate_threshold(ResourceKind::Cpu, 0.0).is_err());
        assert!(validate_threshold(ResourceKind::Cpu, 1.01).is_err());
        assert!(validate_threshold(ResourceKind::Cpu, -0.5).is_err());
        assert!(validate_threshold(ResourceKind::Cpu, 0.333).is_err());
        assert!(validate_threshold(ResourceKind::Cpu, f64::NAN).is_err());
    }

    #[test]
    fn test_limits_must_not_be_empty() {
        assert!(matches!(
            validate_limits(&ResourceLimits::new()),
            Err(GovernanceError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_updated_at_range() {
        assert!(validate_updated_at(0, 100).is_ok());
        assert!(validate_updated_at(100, 100).is_ok());
        assert!(validate_updated_at(-1, 100).is_err());
        assert!(validate_updated_at(101, 100).is_err());
    }

    #[test]
    fn test_empty_update_rejected() {
        assert!(validate_update(&GroupUpdate::default(), 100).is_err());
        let update = GroupUpdate {
            mode: Some(ResiliencyMode::Soft),
            ..Default::default()
        };
        assert!(validate_update(&update, 100).is_ok());
    }

    #[test]
    fn test_check_allocation() {
        let mut table = GroupTable::default();
        table.upsert(ResourceGroup {
            id: "g1".into(),
            name: "one".into(),
            mode: ResiliencyMode::Enforced,
            resource_limits: [(ResourceKind::Memory, 0.6)].into_iter().collect(),
            updated_at_millis: 0,
        });

        let fits: ResourceLimits = [(ResourceKind::Memory, 0.4)].into_iter().collect();
        let too_much: ResourceLimits = [(ResourceKind::Memory, 0.41)].into_iter().collect();

        assert!(check_allocation(&table, &fits, None).is_ok());
        assert!(matches!(
            check_allocation(&table, &too_much, None),
            Err(GovernanceError::OverAllocated {
                kind: ResourceKind::Memory,
                ..
            })
        ));
        // Replacing g1's own limit does not count it twice
        let raised: ResourceLimits = [(ResourceKind::Memory, 0.9)].into_iter().collect();
        assert!(check_allocation(&table, &raised, Some("g1")).is_ok());
    }
}
