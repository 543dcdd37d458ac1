use serde::{Deserialize, Serialize};

/// Connection settings for the S3 compatible object store.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    pub endpoint: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    pub bucket: String,
    /// Key prefix inside the bucket, normalized on load.
    #[serde(default)]
    pub prefix: String,
    /// Path-style addressing is the default; some backends need
    /// virtual-hosted style instead.
    #[serde(default)]
    pub virtual_hosted_style: bool,
    /// Skip request payload checksums for backends that reject them.
    #[serde(default)]
    pub disable_checksums: bool,
    #[serde(default)]
    pub allow_http: bool,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
