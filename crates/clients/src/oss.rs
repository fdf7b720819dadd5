//! OSS POST-policy signing for browser direct upload.
//!
//! The browser uploads straight to the object store with a short-lived
//! signed policy; file bytes never pass through the runtime. The policy is
//! the standard base64(JSON conditions) + HMAC-SHA1 form-POST contract.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::json;
use sha1::Sha1;
use uuid::Uuid;

use tempo_domain::config::OssConfig;
use tempo_domain::{Error, Result, TenantContext};

type HmacSha1 = Hmac<Sha1>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policy document
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct PostPolicy {
    pub upload: UploadTarget,
    pub object: ObjectRef,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadTarget {
    pub method: String,
    pub url: String,
    pub fields: UploadFields,
    pub expire_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadFields {
    pub key: String,
    pub policy: String,
    #[serde(rename = "OSSAccessKeyId")]
    pub oss_access_key_id: String,
    pub success_action_status: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub endpoint: String,
    pub key: String,
    pub url: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PolicySigner {
    config: OssConfig,
}

impl PolicySigner {
    pub fn new(config: OssConfig) -> Self {
        Self { config }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// Issue a POST policy for one upload.
    ///
    /// The object key is prefixed per tenant and user for isolation:
    /// `{prefix}/tenant/{tenant}/user/{user}/{yyyy/mm/dd}/{dir}{uuid}_{filename}`.
    pub fn sign(
        &self,
        tenant: &TenantContext,
        filename: &str,
        dir: Option<&str>,
        expire_seconds: i64,
    ) -> Result<PostPolicy> {
        let key_id = self
            .config
            .access_key_id()
            .ok_or_else(|| Error::Config("OSS access key id not configured".into()))?;
        let key_secret = self
            .config
            .access_key_secret()
            .ok_or_else(|| Error::Config("OSS access key secret not configured".into()))?;
        if self.config.endpoint.is_empty() || self.config.bucket.is_empty() {
            return Err(Error::Config("OSS endpoint/bucket not configured".into()));
        }

        let host = format!("https://{}.{}", self.config.bucket, self.config.endpoint);

        let now = Utc::now();
        let date_prefix = now.format("%Y/%m/%d");
        let safe_dir = normalize_dir(dir);
        let key_prefix = format!(
            "{}/tenant/{}/user/{}/{}/{}",
            self.config.upload_prefix,
            tenant.tenant_id,
            tenant.user_or_anonymous(),
            date_prefix,
            safe_dir,
        );
        let object_key = format!("{key_prefix}{}_{filename}", Uuid::new_v4().simple());

        let expire_at = now + ChronoDuration::seconds(expire_seconds);
        let policy_doc = json!({
            "expiration": expire_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "conditions": [
                ["starts-with", "$key", key_prefix],
                { "bucket": self.config.bucket },
                ["content-length-range", 1, self.config.max_upload_size],
                { "success_action_status": "200" },
            ],
        });
        let policy_b64 = BASE64.encode(policy_doc.to_string().as_bytes());

        let mut mac = HmacSha1::new_from_slice(key_secret.as_bytes())
            .map_err(|e| Error::Internal(format!("hmac: {e}")))?;
        mac.update(policy_b64.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        Ok(PostPolicy {
            upload: UploadTarget {
                method: "POST".into(),
                url: host.clone(),
                fields: UploadFields {
                    key: object_key.clone(),
                    policy: policy_b64,
                    oss_access_key_id: key_id,
                    success_action_status: "200".into(),
                    signature,
                },
                expire_at: expire_at.timestamp(),
            },
            object: ObjectRef {
                bucket: self.config.bucket.clone(),
                endpoint: self.config.endpoint.clone(),
                key: object_key.clone(),
                url: format!("{host}/{object_key}"),
            },
        })
    }
}

fn normalize_dir(dir: Option<&str>) -> String {
    let mut out = dir.unwrap_or("").trim_start_matches('/').trim().to_owned();
    if !out.is_empty() && !out.ends_with('/') {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> PolicySigner {
        std::env::set_var("TEST_OSS_KEY_ID", "LTAItest");
        std::env::set_var("TEST_OSS_KEY_SECRET", "secret");
        PolicySigner::new(OssConfig {
            endpoint: "oss-cn-hangzhou.aliyuncs.com".into(),
            bucket: "tempo-uploads".into(),
            access_key_id_env: "TEST_OSS_KEY_ID".into(),
            access_key_secret_env: "TEST_OSS_KEY_SECRET".into(),
            upload_prefix: "tempoos".into(),
            max_upload_size: 1024,
        })
    }

    fn tenant() -> TenantContext {
        TenantContext::new("t_001", Some("u_9".into()), "tr").unwrap()
    }

    #[test]
    fn policy_fields_are_complete() {
        let policy = signer().sign(&tenant(), "报价.xlsx", None, 600).unwrap();

        assert_eq!(policy.upload.method, "POST");
        assert_eq!(
            policy.upload.url,
            "https://tempo-uploads.oss-cn-hangzhou.aliyuncs.com"
        );
        assert!(policy.upload.fields.key.starts_with("tempoos/tenant/t_001/user/u_9/"));
        assert!(policy.upload.fields.key.ends_with("_报价.xlsx"));
        assert_eq!(policy.upload.fields.oss_access_key_id, "LTAItest");
        assert_eq!(policy.upload.fields.success_action_status, "200");
        assert!(!policy.upload.fields.signature.is_empty());
        assert!(policy.object.url.ends_with(&policy.object.key));
        assert!(policy.upload.expire_at > Utc::now().timestamp());
    }

    #[test]
    fn policy_document_constrains_key_prefix_and_size() {
        let policy = signer().sign(&tenant(), "a.pdf", Some("templates"), 600).unwrap();
        let decoded = BASE64.decode(&policy.upload.fields.policy).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&decoded).unwrap();

        let conditions = doc["conditions"].as_array().unwrap();
        let starts_with = &conditions[0];
        assert_eq!(starts_with[0], "starts-with");
        assert!(starts_with[2].as_str().unwrap().contains("templates/"));
        assert_eq!(conditions[2][2], 1024);
        assert!(policy.upload.fields.key.contains("/templates/"));
    }

    #[test]
    fn anonymous_user_gets_placeholder_segment() {
        let tenant = TenantContext::new("t_001", None, "tr").unwrap();
        let policy = signer().sign(&tenant, "a.pdf", None, 60).unwrap();
        assert!(policy.object.key.contains("/user/anonymous/"));
    }

    #[test]
    fn signature_is_deterministic_for_same_policy() {
        let signer = signer();
        let policy = signer.sign(&tenant(), "a.pdf", None, 600).unwrap();
        // Re-signing the same base64 policy must reproduce the signature.
        let mut mac = HmacSha1::new_from_slice(b"secret").unwrap();
        mac.update(policy.upload.fields.policy.as_bytes());
        let expected = BASE64.encode(mac.finalize().into_bytes());
        assert_eq!(policy.upload.fields.signature, expected);
    }
}
