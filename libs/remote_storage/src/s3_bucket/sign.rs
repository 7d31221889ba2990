//! AWS Signature Version 4.
//!
//! Builds the canonical request, the string-to-sign and the HMAC signing-key
//! chain, producing the `Authorization` header value. The service name is a
//! parameter so the key chain can be verified against the published AWS
//! examples.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Payload hash value for requests signed without hashing the body.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
/// SHA-256 of the empty string, used for body-less requests.
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// The two timestamps a signature needs: `YYYYMMDD` and `YYYYMMDDTHHMMSSZ`.
#[derive(Clone, Debug)]
pub struct RequestDates {
    pub short: String,
    pub long: String,
}

impl RequestDates {
    pub fn now() -> RequestDates {
        let now = chrono::Utc::now();
        RequestDates {
            short: now.format("%Y%m%d").to_string(),
            long: now.format("%Y%m%dT%H%M%SZ").to_string(),
        }
    }
}

pub struct SigV4Signer {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub service: String,
}

impl SigV4Signer {
    /// Compute the `Authorization` header for a request.
    ///
    /// `headers` must hold the to-be-signed headers as (lowercase name,
    /// value) pairs in ascending name order; `host` and the `x-amz-*`
    /// headers belong there.
    pub fn authorization(
        &self,
        dates: &RequestDates,
        method: &str,
        canonical_uri: &str,
        canonical_query: &str,
        headers: &[(&str, &str)],
        payload_hash: &str,
    ) -> String {
        let signed_headers = headers
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(";");

        let mut canonical_request = String::new();
        canonical_request.push_str(method);
        canonical_request.push('\n');
        canonical_request.push_str(canonical_uri);
        canonical_request.push('\n');
        canonical_request.push_str(canonical_query);
        canonical_request.push('\n');
        for (name, value) in headers {
            canonical_request.push_str(name);
            canonical_request.push(':');
            canonical_request.push_str(value);
            canonical_request.push('\n');
        }
        canonical_request.push('\n');
        canonical_request.push_str(&signed_headers);
        canonical_request.push('\n');
        canonical_request.push_str(payload_hash);

        let scope = format!(
            "{}/{}/{}/aws4_request",
            dates.short, self.region, self.service
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            dates.long,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        // Signing key chain:
        // HMAC(HMAC(HMAC(HMAC("AWS4"+secret, date), region), service), "aws4_request")
        let k_date = hmac_sha256(
            format!("AWS4{}", self.secret_access_key).as_bytes(),
            dates.short.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        format!(
            "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
            self.access_key_id, scope, signed_headers, signature
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The GET example from the AWS General Reference chapter on Signature
    /// Version 4: ListUsers against IAM with the published example
    /// credentials and timestamp.
    #[test]
    fn aws_documentation_vector() {
        let signer = SigV4Signer {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            region: "us-east-1".to_string(),
            service: "iam".to_string(),
        };
        let dates = RequestDates {
            short: "20150830".to_string(),
            long: "20150830T123600Z".to_string(),
        };
        let auth = signer.authorization(
            &dates,
            "GET",
            "/",
            "Action=ListUsers&Version=2010-05-08",
            &[
                (
                    "content-type",
                    "application/x-www-form-urlencoded; charset=utf-8",
                ),
                ("host", "iam.amazonaws.com"),
                ("x-amz-date", "20150830T123600Z"),
            ],
            EMPTY_PAYLOAD_SHA256,
        );
        assert_eq!(
            auth,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request,\
             SignedHeaders=content-type;host;x-amz-date,\
             Signature=5d672d79c15b13162d9279b0855cfba6789a8edb4c82c400e06b5924a6f2b5d7"
        );
    }

    #[test]
    fn empty_payload_hash_is_sha256_of_nothing() {
        assert_eq!(sha256_hex(b""), EMPTY_PAYLOAD_SHA256);
    }
}
