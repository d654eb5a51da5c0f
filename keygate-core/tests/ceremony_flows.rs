//! Ceremony flows against in-memory storage: anti-enumeration, description
//! conflicts, counter handling and concurrent access.

use std::sync::Arc;

use keygate_core::webauthn::storage::ConflictKind;
use keygate_core::webauthn::types::{KeyMaterial, NewCredential, COSE_ALG_ES256};
use keygate_core::{
    CeremonyEngine, Config, CounterPolicy, CredentialForm, CredentialHandle,
    DummyCredentialGenerator, ErrorCode, LoginChallengeForm, LoginVerifyForm, MemoryStore,
    PasskeyService, RelyingParty, StorageError, UserAccount, WebAuthnStorage,
};
use uuid::Uuid;

fn service(users: &[UserAccount]) -> PasskeyService {
    let store = MemoryStore::new();
    for user in users {
        store.add_user(user.clone());
    }

    let rp = RelyingParty::from_config(&Config::default()).unwrap();
    PasskeyService::new(
        CeremonyEngine::new(rp, CounterPolicy::Warn),
        Arc::new(WebAuthnStorage::memory(store)),
        DummyCredentialGenerator::new([0x11; 32]),
        300,
    )
}

fn new_credential(user_id: Uuid, handle: Vec<u8>, description: &str) -> NewCredential {
    NewCredential {
        user_id,
        handle: CredentialHandle::new(handle),
        key: KeyMaterial {
            algorithm: COSE_ALG_ES256,
            encoded: b"{}".to_vec(),
        },
        aaguid: Uuid::nil(),
        sign_count: 0,
        description: description.to_string(),
    }
}

fn forged_assertion(username: &str, handle: &CredentialHandle) -> LoginVerifyForm {
    let id = handle.to_base64url();
    let credential = serde_json::json!({
        "id": id,
        "rawId": id,
        "response": {
            "authenticatorData": "AAAA",
            "clientDataJSON": "AAAA",
            "signature": "AAAA",
            "userHandle": null
        },
        "extensions": {},
        "type": "public-key"
    });

    LoginVerifyForm {
        username: username.to_string(),
        public_key_credential: credential.to_string(),
    }
}

fn bytes<T: AsRef<[u8]>>(data: &T) -> Vec<u8> {
    data.as_ref().to_vec()
}

fn login_form(username: &str) -> LoginChallengeForm {
    LoginChallengeForm {
        username: username.to_string(),
    }
}

fn public_key_fields(value: &serde_json::Value) -> Vec<String> {
    let mut keys: Vec<String> = value["publicKey"]
        .as_object()
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default();
    keys.sort();
    keys
}

#[tokio::test]
async fn test_user_without_credentials_gets_dummy_and_bad_credentials() {
    let alice = UserAccount::new("alice", None);
    let service = service(&[alice.clone()]);

    let rcr = service.start_login("s1", &login_form("alice")).await.unwrap();
    assert_eq!(rcr.public_key.allow_credentials.len(), 1);

    let dummy_handle = CredentialHandle::new(bytes(&rcr.public_key.allow_credentials[0].id));
    assert_eq!(dummy_handle.len(), 32);

    let failure = service
        .verify_login("s1", &forged_assertion("alice", &dummy_handle))
        .await
        .unwrap_err();
    assert_eq!(failure.code, ErrorCode::BadCredentials);

    let retry = failure.retry.expect("failed login carries fresh options");
    assert_eq!(retry.public_key.allow_credentials.len(), 1);
    assert_eq!(
        bytes(&retry.public_key.allow_credentials[0].id),
        dummy_handle.as_bytes()
    );
    assert_ne!(
        bytes(&retry.public_key.challenge),
        bytes(&rcr.public_key.challenge)
    );
}

#[tokio::test]
async fn test_unknown_username_options_match_real_user() {
    let bob = UserAccount::new("bob", None);
    let service = service(&[bob.clone()]);
    service
        .storage()
        .create_credential(new_credential(bob.id, vec![7; 32], "Laptop"))
        .await
        .unwrap();

    let real = service.start_login("s1", &login_form("bob")).await.unwrap();
    let unknown = service.start_login("s2", &login_form("mallory")).await.unwrap();

    let real_json = serde_json::to_value(&real).unwrap();
    let unknown_json = serde_json::to_value(&unknown).unwrap();
    assert_eq!(public_key_fields(&real_json), public_key_fields(&unknown_json));
    assert_eq!(
        real_json.as_object().map(|o| o.len()),
        unknown_json.as_object().map(|o| o.len())
    );
    assert_eq!(
        real.public_key.allow_credentials.len(),
        unknown.public_key.allow_credentials.len()
    );
    assert_eq!(
        bytes(&real.public_key.allow_credentials[0].id).len(),
        bytes(&unknown.public_key.allow_credentials[0].id).len()
    );
}

#[tokio::test]
async fn test_unknown_username_dummy_is_stable() {
    let service = service(&[]);

    let first = service.start_login("s1", &login_form("mallory")).await.unwrap();
    let second = service.start_login("s2", &login_form("mallory")).await.unwrap();
    let other = service.start_login("s3", &login_form("trudy")).await.unwrap();

    let handle = |rcr: &webauthn_rs_proto::RequestChallengeResponse| {
        bytes(&rcr.public_key.allow_credentials[0].id)
    };
    assert_eq!(handle(&first), handle(&second));
    assert_ne!(handle(&first), handle(&other));
}

#[tokio::test]
async fn test_duplicate_description_rejected_before_verification() {
    let alice = UserAccount::new("alice", None);
    let service = service(&[alice.clone()]);
    service
        .storage()
        .create_credential(new_credential(alice.id, vec![1; 16], "YubiKey 5"))
        .await
        .unwrap();

    service.start_registration("s1", alice.id).await.unwrap();

    // The response is garbage; reaching verification would yield a different code.
    let form = CredentialForm {
        description: "yubikey 5".to_string(),
        public_key: "{}".to_string(),
    };
    let failure = service.save_credential("s1", alice.id, &form).await.unwrap_err();
    assert_eq!(failure.code, ErrorCode::CredentialAlreadyExists);

    assert_eq!(service.storage().stats().await.unwrap().pending_states, 0);
    assert_eq!(service.credentials(alice.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_equal_counter_is_flagged_and_kept() {
    let alice = UserAccount::new("alice", None);
    let service = service(&[alice.clone()]);
    let mut new = new_credential(alice.id, vec![2; 16], "Phone");
    new.sign_count = 5;
    let credential = service.storage().create_credential(new).await.unwrap();

    let update = service
        .storage()
        .update_counter(&credential.handle, 5)
        .await
        .unwrap();
    assert!(update.regressed);
    assert!(update.clone_warning);
    assert_eq!(update.stored, 5);

    let update = service
        .storage()
        .update_counter(&credential.handle, 3)
        .await
        .unwrap();
    assert_eq!(update.stored, 5);

    let stored = &service.credentials(alice.id).await.unwrap()[0];
    assert!(stored.clone_warning);
    assert_eq!(stored.sign_count, 5);
}

#[tokio::test]
async fn test_concurrent_creates_single_winner() {
    let storage = Arc::new(WebAuthnStorage::in_memory());
    let user_id = Uuid::new_v4();

    let tasks: Vec<_> = (0..8u8)
        .map(|i| {
            let storage = storage.clone();
            tokio::spawn(async move {
                storage
                    .create_credential(new_credential(user_id, vec![i; 16], "YubiKey 5"))
                    .await
            })
        })
        .collect();

    let mut created = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => created += 1,
            Err(StorageError::Conflict(ConflictKind::Description)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(conflicts, 7);
}

#[tokio::test]
async fn test_remove_credential_is_owner_checked() {
    let alice = UserAccount::new("alice", None);
    let bob = UserAccount::new("bob", None);
    let service = service(&[alice.clone(), bob.clone()]);
    let credential = service
        .storage()
        .create_credential(new_credential(alice.id, vec![3; 16], "Laptop"))
        .await
        .unwrap();

    let err = service
        .remove_credential(bob.id, credential.id)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound));

    service.remove_credential(alice.id, credential.id).await.unwrap();
    assert!(service.credentials(alice.id).await.unwrap().is_empty());
}
