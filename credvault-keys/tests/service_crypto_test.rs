mod common;

use std::collections::HashMap;

use credvault_keys::{
    CredentialService, Digest, ErrorCode, PolicySnapshot, ProfileRef, ProfileType,
    SymmetricCipher,
};

use common::{make_ca, make_fresh_leaf, pkcs12_bundle};

fn service_with_credential(
    dir: &tempfile::TempDir,
) -> (CredentialService, credvault_keys::CredentialId) {
    let service =
        CredentialService::new("crypto-test", dir.path().join("store.bin"), b"secret").unwrap();
    service
        .lifecycle()
        .upsert_profile("p1", "Signing", ProfileType::AppBased, true, HashMap::new())
        .unwrap();

    let (ca, ca_key) = make_ca("Crypto CA");
    let (leaf, key) = make_fresh_leaf(&ca, &ca_key, "crypto-user");
    let bundle = pkcs12_bundle(&leaf, &key, &ca, "pw");
    let (id, profile_id) = service.import_pkcs12(&bundle, "pw", ProfileRef::Mapped).unwrap();
    service.import_done(&profile_id).unwrap();
    (service, id)
}

#[test]
fn sign_and_verify_with_a_stored_credential() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (service, id) = service_with_credential(&dir);
    let credential = service.find(&id).unwrap();

    let signature = service.sign_data(&id, b"message", Digest::Sha256).unwrap();
    assert!(service
        .verify_data(&credential.leaf, b"message", &signature, Digest::Sha256)
        .unwrap());

    // A different message fails as a trusted negative.
    assert!(!service
        .verify_data(&credential.leaf, b"other", &signature, Digest::Sha256)
        .unwrap());
}

#[test]
fn signed_envelope_round_trip_through_the_service() {
    let dir = tempfile::tempdir().unwrap();
    let (service, id) = service_with_credential(&dir);
    let credential = service.find(&id).unwrap();

    let der = service
        .sign_envelope(&id, b"envelope content", Digest::Sha256)
        .unwrap();
    let trusted = service
        .verify_envelope(&der, &[credential.leaf.clone()], None, None)
        .unwrap();
    assert!(trusted);

    // Chain evaluation against the imported auxiliary CA.
    let trusted = service
        .verify_envelope(&der, &[credential.leaf], Some(&credential.aux), None)
        .unwrap();
    assert!(trusted);
}

#[test]
fn enveloped_data_round_trip_through_the_service() {
    let dir = tempfile::tempdir().unwrap();
    let (service, id) = service_with_credential(&dir);
    let credential = service.find(&id).unwrap();

    let der = service
        .encrypt_envelope(&[credential.leaf], SymmetricCipher::Aes256Cbc, b"secret")
        .unwrap();
    let plaintext = service.decrypt_envelope(&id, &der).unwrap();
    assert_eq!(plaintext, b"secret");
}

#[test]
fn fips_mode_gates_digests_and_ciphers_before_key_use() {
    let dir = tempfile::tempdir().unwrap();
    let (service, id) = service_with_credential(&dir);
    let credential = service.find(&id).unwrap();

    service.apply_policy(PolicySnapshot {
        fips_mode: true,
        ..PolicySnapshot::default()
    });

    let err = service.sign_data(&id, b"m", Digest::Sha1).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotAllowed);
    let err = service
        .encrypt_envelope(&[credential.leaf.clone()], SymmetricCipher::Rc2Cbc, b"m")
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotAllowed);

    // Approved algorithms keep working under the same policy.
    let signature = service.sign_data(&id, b"m", Digest::Sha256).unwrap();
    assert!(service
        .verify_data(&credential.leaf, b"m", &signature, Digest::Sha256)
        .unwrap());
    service
        .encrypt_envelope(&[credential.leaf], SymmetricCipher::Aes256Cbc, b"m")
        .unwrap();
}

#[test]
fn operations_on_an_unknown_credential_are_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _) = service_with_credential(&dir);

    let missing = credvault_keys::CredentialId::new("CN=Nobody", "00");
    let err = service.sign_data(&missing, b"m", Digest::Sha256).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    let err = service.decrypt_envelope(&missing, b"junk").unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
}
