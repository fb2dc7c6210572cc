use crate::{
    abi::AbiEntry,
    types::Address,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use itertools::Itertools;
use serde::Deserialize;
use sha2::{
    Digest,
    Sha256,
};
use std::{
    collections::BTreeMap,
    fs,
    path::{
        Path,
        PathBuf,
    },
};

pub const DEFAULT_MANIFEST_PATH: &str = "contracts/MyContract.json";

/// Build artifact describing the store contract: its interface descriptor
/// and the address it was deployed to on each network.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentManifest {
    #[serde(default)]
    pub contract_name: Option<String>,
    pub abi: Vec<AbiEntry>,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkDeployment>,
    #[serde(default)]
    pub deployed_bytecode: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDeployment {
    pub address: Address,
    #[serde(default)]
    pub transaction_hash: Option<String>,
}

/// Result of comparing on-chain code with the manifest's runtime bytecode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CodeCheck {
    /// The manifest carries no usable runtime bytecode.
    Unchecked,
    Match,
    Mismatch { expected: String, actual: String },
    /// Nothing is deployed at the recorded address.
    Missing,
}

impl DeploymentManifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).wrap_err_with(|| {
            format!("Failed to read contract manifest: {}", path.display())
        })?;
        Self::from_json(&data)
            .wrap_err_with(|| format!("Failed to parse contract manifest: {}", path.display()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).wrap_err("Invalid contract manifest JSON")
    }

    pub fn name(&self) -> &str {
        self.contract_name.as_deref().unwrap_or("contract")
    }

    pub fn deployment_for(&self, network_id: &str) -> Option<&NetworkDeployment> {
        self.networks.get(network_id)
    }

    pub fn address_for(&self, network_id: &str) -> Option<Address> {
        self.deployment_for(network_id).map(|d| d.address)
    }

    /// SHA-256 of the runtime bytecode, or `None` when the artifact has none
    /// or it still contains unlinked library placeholders.
    pub fn bytecode_hash(&self) -> Option<String> {
        let raw = self.deployed_bytecode.as_deref()?;
        let digits = raw.strip_prefix("0x").unwrap_or(raw);
        if digits.is_empty() {
            return None;
        }
        hex::decode(digits).ok().map(|code| compute_code_hash(&code))
    }

    pub fn check_code(&self, code: &[u8]) -> CodeCheck {
        if code.is_empty() {
            return CodeCheck::Missing;
        }
        let Some(expected) = self.bytecode_hash() else {
            return CodeCheck::Unchecked;
        };
        let actual = compute_code_hash(code);
        if actual == expected {
            CodeCheck::Match
        } else {
            CodeCheck::Mismatch { expected, actual }
        }
    }
}

pub fn compute_code_hash(code: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code);
    format!("{:x}", hasher.finalize())
}

pub fn resolve_manifest_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

/// Explains why no deployment could be used on `network_id`.
pub fn format_deployment_summary(
    manifest: &DeploymentManifest,
    network_id: &str,
    path: &Path,
) -> String {
    let mut message = format!(
        "No deployment of {} recorded for network {network_id}.\n\nRecorded deployments:",
        manifest.name(),
    );
    if manifest.networks.is_empty() {
        message.push_str("\n  (none recorded)");
    } else {
        let lines = manifest
            .networks
            .iter()
            .map(|(id, deployment)| {
                let tx = deployment
                    .transaction_hash
                    .as_deref()
                    .map(hash_preview)
                    .unwrap_or_else(|| "(unknown tx)".to_string());
                format!("  network {id} - {} (tx {tx})", deployment.address)
            })
            .join("\n");
        message.push('\n');
        message.push_str(&lines);
    }
    if let Some(hash) = manifest.bytecode_hash() {
        message.push_str(&format!("\n\nManifest bytecode hash: {}", hash_preview(&hash)));
    }
    message.push_str(&format!("\nManifest file: {}", path.display()));
    message
}

pub fn hash_preview(hash: &str) -> String {
    let preview_len = hash.len().min(16);
    let mut preview = hash[..preview_len].to_string();
    if hash.len() > preview_len {
        preview.push_str("...");
    }
    preview
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    const MANIFEST: &str = r#"{
        "contractName": "MyContract",
        "abi": [
            {"type":"function","name":"getTikets","inputs":[],
             "outputs":[{"name":"","type":"address[16]"}],"stateMutability":"view"}
        ],
        "networks": {
            "5777": {
                "events": {},
                "links": {},
                "address": "0x5b1869D9A4C187F2EAa108f3062412ecf0526b24",
                "transactionHash": "0x9a6b2a3ed4bbf2a40b43bbdc3d5c0dfb9d1f2c3e4a5b6c7d8e9f001122334455"
            }
        },
        "deployedBytecode": "0x6080604052"
    }"#;

    #[test]
    fn from_json__reads_truffle_artifact() {
        // when
        let manifest = DeploymentManifest::from_json(MANIFEST.as_bytes()).unwrap();

        // then
        assert_eq!(manifest.name(), "MyContract");
        assert_eq!(manifest.abi.len(), 1);
        assert_eq!(
            manifest.address_for("5777"),
            Some("0x5b1869d9a4c187f2eaa108f3062412ecf0526b24".parse().unwrap())
        );
        assert_eq!(manifest.address_for("1"), None);
    }

    #[test]
    fn check_code__compares_runtime_bytecode() {
        // given
        let manifest = DeploymentManifest::from_json(MANIFEST.as_bytes()).unwrap();

        // then
        assert_eq!(
            manifest.check_code(&[0x60, 0x80, 0x60, 0x40, 0x52]),
            CodeCheck::Match
        );
        assert!(matches!(
            manifest.check_code(&[0x60, 0x80]),
            CodeCheck::Mismatch { .. }
        ));
        assert_eq!(manifest.check_code(&[]), CodeCheck::Missing);
    }

    #[test]
    fn check_code__skips_unlinked_bytecode() {
        // given
        let mut manifest = DeploymentManifest::from_json(MANIFEST.as_bytes()).unwrap();
        manifest.deployed_bytecode = Some("0x6080__Lib__________________________________6040".into());

        // then
        assert_eq!(manifest.bytecode_hash(), None);
        assert_eq!(manifest.check_code(&[0x60]), CodeCheck::Unchecked);
    }

    #[test]
    fn load__reports_missing_file_with_path() {
        let err = DeploymentManifest::load("/nonexistent/MyContract.json").unwrap_err();
        assert!(format!("{err}").contains("/nonexistent/MyContract.json"));
    }

    #[test]
    fn format_deployment_summary__lists_recorded_networks() {
        // given
        let manifest = DeploymentManifest::from_json(MANIFEST.as_bytes()).unwrap();

        // when
        let summary =
            format_deployment_summary(&manifest, "1", Path::new("contracts/MyContract.json"));

        // then
        assert!(summary.starts_with("No deployment of MyContract recorded for network 1."));
        assert!(summary.contains(
            "network 5777 - 0x5b1869d9a4c187f2eaa108f3062412ecf0526b24 (tx 0x9a6b2a3ed4bbf2...)"
        ));
        assert!(summary.ends_with("Manifest file: contracts/MyContract.json"));
    }

    #[test]
    fn hash_preview__truncates_long_hashes() {
        assert_eq!(hash_preview("abc"), "abc");
        assert_eq!(hash_preview("0123456789abcdef0123"), "0123456789abcdef...");
    }
}
