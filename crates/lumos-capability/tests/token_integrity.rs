use lumos_capability::{CapabilityService, VerifyError};
use lumos_types::Capability;

fn service_with_token() -> (CapabilityService, String) {
    let svc = CapabilityService::new();
    svc.init_key();
    let grant = svc.grant("integrity-app", &[Capability::UiWindow]).unwrap();
    let token = grant.tokens.values().next().unwrap().clone();
    (svc, token)
}

#[test]
fn forged_zero_signature_is_invalid_signature() {
    let (svc, token) = service_with_token();

    let mut parts: Vec<&str> = token.split('.').collect();
    assert_eq!(parts.len(), 3);
    // 32 zero bytes, URL-safe base64 without padding.
    let zero_sig = base64_url(&[0u8; 32]);
    parts[2] = &zero_sig;
    let forged = parts.join(".");

    assert_eq!(svc.verify(&forged), Err(VerifyError::InvalidSignature));
}

#[test]
fn any_single_character_mutation_invalidates_the_token() {
    let (svc, token) = service_with_token();

    for (i, original) in token.char_indices() {
        if original == '.' {
            continue;
        }
        let replacement = if original == 'A' { 'B' } else { 'A' };
        if original == replacement {
            continue;
        }
        let mut mutated = token.clone();
        mutated.replace_range(i..i + original.len_utf8(), &replacement.to_string());

        match svc.verify(&mutated) {
            Err(VerifyError::InvalidSignature)
            | Err(VerifyError::Malformed)
            | Err(VerifyError::InvalidPayload) => {}
            other => panic!("mutation at {i} produced {other:?}"),
        }
    }
}

#[test]
fn tokens_from_one_app_do_not_whitelist_another() {
    let svc = CapabilityService::new();
    svc.init_key();
    svc.grant("app-a", &[Capability::StorageLocal]).unwrap();

    assert!(svc.check("app-a", Capability::StorageLocal));
    assert!(!svc.check("app-b", Capability::StorageLocal));
}

#[test]
fn granted_set_is_subset_of_requested() {
    let svc = CapabilityService::new();
    svc.init_key();
    let requested = [Capability::UiWindow, Capability::TimerBasic];
    let grant = svc.grant("subset-app", &requested).unwrap();
    for cap in &grant.capabilities {
        assert!(requested.contains(cap));
    }
}

fn base64_url(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
