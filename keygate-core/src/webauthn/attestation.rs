//! Attestation object parsing
//!
//! Pulls the authenticator model, initial signature counter, credential handle
//! and COSE algorithm out of a registration's attestation object. Signature
//! and format checks are the verifier's job; this only reads the layout.

use ciborium::de::from_reader;
use ciborium::value::Value;
use uuid::Uuid;

use crate::error::CeremonyError;

use super::types::CredentialHandle;

/// Attested credential data flag in the authenticator data flags byte
const FLAG_ATTESTED_CREDENTIAL_DATA: u8 = 0x40;

/// rpIdHash (32) + flags (1) + signCount (4)
const AUTH_DATA_HEADER_LEN: usize = 37;

/// COSE key map label for the algorithm
const COSE_KEY_ALG: i128 = 3;

/// Fields read from the attested credential data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestedCredential {
    pub aaguid: Uuid,
    pub sign_count: u32,
    pub handle: CredentialHandle,
    /// COSE algorithm identifier of the credential public key
    pub algorithm: i64,
}

fn invalid(reason: &str) -> CeremonyError {
    CeremonyError::AttestationInvalid(reason.to_string())
}

/// Parse a CBOR attestation object
pub fn parse_attestation_object(bytes: &[u8]) -> Result<AttestedCredential, CeremonyError> {
    let attestation: Value =
        from_reader(bytes).map_err(|_| invalid("Invalid CBOR attestation format"))?;

    let Some(Some(auth_data)) = attestation.as_map().and_then(|map| {
        map.iter()
            .find(|(k, _)| k.as_text() == Some("authData"))
            .map(|(_, v)| v.as_bytes())
    }) else {
        return Err(invalid("Missing authData in attestation"));
    };

    parse_auth_data(auth_data)
}

/// Parse authenticator data that carries attested credential data
pub fn parse_auth_data(auth_data: &[u8]) -> Result<AttestedCredential, CeremonyError> {
    if auth_data.len() < AUTH_DATA_HEADER_LEN {
        return Err(invalid("Auth data too short"));
    }

    let flags = auth_data[32];
    if flags & FLAG_ATTESTED_CREDENTIAL_DATA == 0 {
        return Err(invalid("No attested credential data"));
    }

    let sign_count = u32::from_be_bytes([auth_data[33], auth_data[34], auth_data[35], auth_data[36]]);

    let mut pos = AUTH_DATA_HEADER_LEN;
    let aaguid_bytes: [u8; 16] = auth_data
        .get(pos..pos + 16)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| invalid("Auth data too short for AAGUID"))?;
    pos += 16;

    let id_len = auth_data
        .get(pos..pos + 2)
        .map(|len| usize::from(u16::from_be_bytes([len[0], len[1]])))
        .ok_or_else(|| invalid("Auth data too short for credential ID length"))?;
    pos += 2;

    let credential_id = auth_data
        .get(pos..pos + id_len)
        .ok_or_else(|| invalid("Auth data too short for credential ID"))?;
    pos += id_len;

    let cose_key = auth_data
        .get(pos..)
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| invalid("Auth data too short for public key"))?;

    Ok(AttestedCredential {
        aaguid: Uuid::from_bytes(aaguid_bytes),
        sign_count,
        handle: CredentialHandle::from_slice(credential_id),
        algorithm: cose_algorithm(cose_key)?,
    })
}

fn cose_algorithm(cose_key: &[u8]) -> Result<i64, CeremonyError> {
    // Extension data may follow the key; from_reader stops after one item.
    let key: Value = from_reader(cose_key).map_err(|_| invalid("Invalid COSE public key"))?;

    key.as_map()
        .and_then(|map| {
            map.iter()
                .find(|(k, _)| k.as_integer().map(i128::from) == Some(COSE_KEY_ALG))
                .and_then(|(_, v)| v.as_integer())
        })
        .and_then(|alg| i64::try_from(i128::from(alg)).ok())
        .ok_or_else(|| invalid("COSE key has no algorithm"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webauthn::types::COSE_ALG_ES256;

    fn cose_key(alg: i64) -> Vec<u8> {
        let key = Value::Map(vec![
            (Value::Integer(1.into()), Value::Integer(2.into())),
            (Value::Integer(3.into()), Value::Integer(alg.into())),
            (Value::Integer((-1).into()), Value::Integer(1.into())),
        ]);
        let mut out = Vec::new();
        ciborium::ser::into_writer(&key, &mut out).unwrap();
        out
    }

    fn auth_data(flags: u8, counter: u32, aaguid: [u8; 16], cred_id: &[u8], key: &[u8]) -> Vec<u8> {
        let mut data = vec![0xaa; 32];
        data.push(flags);
        data.extend_from_slice(&counter.to_be_bytes());
        data.extend_from_slice(&aaguid);
        data.extend_from_slice(&(cred_id.len() as u16).to_be_bytes());
        data.extend_from_slice(cred_id);
        data.extend_from_slice(key);
        data
    }

    fn attestation_object(auth_data: Vec<u8>) -> Vec<u8> {
        let object = Value::Map(vec![
            (Value::Text("fmt".to_string()), Value::Text("none".to_string())),
            (Value::Text("attStmt".to_string()), Value::Map(vec![])),
            (Value::Text("authData".to_string()), Value::Bytes(auth_data)),
        ]);
        let mut out = Vec::new();
        ciborium::ser::into_writer(&object, &mut out).unwrap();
        out
    }

    #[test]
    fn test_parse_attestation_object() {
        let aaguid = [0x11; 16];
        let data = auth_data(0x45, 7, aaguid, b"credential-1", &cose_key(COSE_ALG_ES256));

        let parsed = parse_attestation_object(&attestation_object(data)).unwrap();
        assert_eq!(parsed.aaguid, Uuid::from_bytes(aaguid));
        assert_eq!(parsed.sign_count, 7);
        assert_eq!(parsed.handle.as_bytes(), b"credential-1");
        assert_eq!(parsed.algorithm, COSE_ALG_ES256);
    }

    #[test]
    fn test_trailing_extension_data_is_ignored() {
        let mut key = cose_key(-257);
        key.extend_from_slice(&[0xa0]);
        let data = auth_data(0xc5, 0, [0; 16], b"id", &key);

        let parsed = parse_auth_data(&data).unwrap();
        assert_eq!(parsed.algorithm, -257);
        assert!(parsed.aaguid.is_nil());
    }

    #[test]
    fn test_missing_attested_data_flag() {
        let data = auth_data(0x05, 0, [0; 16], b"id", &cose_key(COSE_ALG_ES256));
        assert!(matches!(
            parse_auth_data(&data),
            Err(CeremonyError::AttestationInvalid(_))
        ));
    }

    #[test]
    fn test_truncated_auth_data() {
        let mut data = auth_data(0x45, 0, [0; 16], b"credential", &[]);
        data.truncate(AUTH_DATA_HEADER_LEN + 16 + 2 + 3);
        assert!(parse_auth_data(&data).is_err());

        assert!(parse_auth_data(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_garbage_attestation_object() {
        assert!(parse_attestation_object(b"not cbor at all").is_err());

        let mut no_auth_data = Vec::new();
        ciborium::ser::into_writer(&Value::Map(vec![]), &mut no_auth_data).unwrap();
        assert!(parse_attestation_object(&no_auth_data).is_err());
    }
}
