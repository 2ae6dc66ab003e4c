//! Tests for trust defaults, overrides, and capability denial formatting.

use std::{collections::BTreeMap, str::FromStr};

use super::{
    format_capability_denied, get_default_permissions, high_risk_escalations,
    is_capability_allowed, resolve_permission_set, set_capability_allowed, Capability,
    CapabilityGate, PermissionError, PermissionSet, TrustLevel,
};

#[test]
fn unit_builtin_defaults_grant_every_capability() {
    let permissions = get_default_permissions(TrustLevel::Builtin);
    for capability in Capability::ALL {
        assert!(permissions.allows(capability), "{capability} should be granted");
    }
}

#[test]
fn unit_local_module_defaults_withhold_network_and_skill_writes() {
    let permissions = get_default_permissions(TrustLevel::LocalModule);
    assert!(!permissions.allows(Capability::HttpFetch));
    assert!(!permissions.allows(Capability::SkillsWrite));
    assert!(permissions.allows(Capability::ToolsRegister));
    assert!(permissions.allows(Capability::StorageReadWrite));
}

#[test]
fn unit_untrusted_defaults_are_limited_to_safe_ui() {
    for trust in [TrustLevel::InlineCode, TrustLevel::RemoteUrl] {
        let permissions = get_default_permissions(trust);
        assert!(!is_capability_allowed(&permissions, Capability::ToolsRegister));
        assert!(!is_capability_allowed(&permissions, Capability::HttpFetch));
        assert!(!is_capability_allowed(&permissions, Capability::LlmComplete));
        assert!(!is_capability_allowed(&permissions, Capability::AgentSteer));
        assert!(!is_capability_allowed(&permissions, Capability::StorageReadWrite));
        assert!(is_capability_allowed(&permissions, Capability::UiToast));
        assert!(is_capability_allowed(&permissions, Capability::UiOverlay));
        assert!(is_capability_allowed(&permissions, Capability::UiWidget));
        assert!(permissions.high_risk_grants().is_empty());
    }
}

#[test]
fn functional_set_capability_allowed_is_pure_and_isolated() {
    let original = get_default_permissions(TrustLevel::InlineCode);
    let updated = set_capability_allowed(&original, Capability::HttpFetch, true);

    assert!(!original.allows(Capability::HttpFetch));
    assert!(updated.allows(Capability::HttpFetch));
    for capability in Capability::ALL {
        if capability != Capability::HttpFetch {
            assert_eq!(
                original.allows(capability),
                updated.allows(capability),
                "{capability} must not change"
            );
        }
    }

    let revoked = set_capability_allowed(&updated, Capability::UiToast, false);
    assert!(!revoked.allows(Capability::UiToast));
    assert!(revoked.allows(Capability::HttpFetch));
}

#[test]
fn functional_resolve_permission_set_overlays_overrides_and_skips_unknown_names() {
    let overrides = BTreeMap::from([
        ("ui.overlay".to_string(), false),
        ("tools.register".to_string(), true),
        ("teleport.user".to_string(), true),
    ]);
    let permissions = resolve_permission_set(TrustLevel::InlineCode, &overrides);
    assert!(!permissions.allows(Capability::UiOverlay));
    assert!(permissions.allows(Capability::ToolsRegister));
    assert!(permissions.allows(Capability::UiToast));
}

#[test]
fn functional_high_risk_escalations_ignore_builtin_and_existing_grants() {
    let baseline = get_default_permissions(TrustLevel::InlineCode);
    let candidate = baseline
        .with(Capability::HttpFetch, true)
        .with(Capability::DownloadFile, true);
    assert_eq!(
        high_risk_escalations(TrustLevel::InlineCode, &baseline, &candidate),
        vec![Capability::HttpFetch]
    );
    assert!(high_risk_escalations(TrustLevel::Builtin, &baseline, &candidate).is_empty());
    assert!(high_risk_escalations(TrustLevel::InlineCode, &candidate, &candidate).is_empty());
}

#[test]
fn unit_capability_gate_formats_denial_sentence() {
    let gate = CapabilityGate::new(
        "Denied Extension",
        get_default_permissions(TrustLevel::InlineCode).with(Capability::UiOverlay, false),
    );
    assert_eq!(
        gate.check(Capability::UiOverlay),
        Err(
            "Permission denied for extension \"Denied Extension\": cannot show overlays."
                .to_string()
        )
    );
    assert_eq!(gate.check(Capability::UiToast), Ok(()));
    assert_eq!(
        format_capability_denied("Sheet Helper", Capability::ToolsRegister),
        "Permission denied for extension \"Sheet Helper\": cannot register tools."
    );
}

#[test]
fn unit_capability_and_trust_names_parse() {
    for capability in Capability::ALL {
        assert_eq!(Capability::from_str(capability.as_str()), Ok(capability));
    }
    assert_eq!(
        TrustLevel::from_str("remote-url"),
        Ok(TrustLevel::RemoteUrl)
    );
    assert_eq!(
        TrustLevel::from_str("vendor"),
        Err(PermissionError::UnknownTrustLevel("vendor".to_string()))
    );
    assert!(TrustLevel::Builtin < TrustLevel::RemoteUrl);
}

#[test]
fn regression_permission_set_serializes_as_total_map() {
    let permissions = PermissionSet::from_capabilities([Capability::UiToast]);
    let value = serde_json::to_value(permissions).expect("serialize");
    let object = value.as_object().expect("object");
    assert_eq!(object.len(), Capability::ALL.len());
    assert_eq!(object["ui.toast"], true);
    assert_eq!(object["http.fetch"], false);

    let decoded: PermissionSet = serde_json::from_value(value).expect("deserialize");
    assert_eq!(decoded, permissions);
}
