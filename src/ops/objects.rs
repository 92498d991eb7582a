//! Typed cluster objects and their YAML stream form.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Namespace the bootstrap cluster's chart controller watches.
pub const CHART_NAMESPACE: &str = "kube-system";

/// A chart installation request picked up by the bootstrap cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmChart {
    pub name: String,
    /// `oci://` URL of the chart in the local registry.
    pub chart: String,
    pub version: String,
    pub target_namespace: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub values: Value,
    /// PEM bundle trusted when pulling the chart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_ca: Option<String>,
}

/// One cluster object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum ClusterObject {
    ConfigMap {
        name: String,
        namespace: String,
        data: BTreeMap<String, String>,
    },
    Secret {
        name: String,
        namespace: String,
        #[serde(rename = "type")]
        secret_type: String,
        string_data: BTreeMap<String, String>,
    },
    HelmChart(HelmChart),
}

impl ClusterObject {
    pub fn config_map(
        name: impl Into<String>,
        namespace: impl Into<String>,
        data: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        ClusterObject::ConfigMap {
            name: name.into(),
            namespace: namespace.into(),
            data: data.into_iter().collect(),
        }
    }

    /// A `kubernetes.io/tls` secret.
    pub fn tls_secret(
        name: impl Into<String>,
        namespace: impl Into<String>,
        cert: &str,
        key: &str,
        ca: &str,
    ) -> Self {
        let string_data = [
            ("tls.crt".to_string(), cert.to_string()),
            ("tls.key".to_string(), key.to_string()),
            ("ca.crt".to_string(), ca.to_string()),
        ];
        ClusterObject::Secret {
            name: name.into(),
            namespace: namespace.into(),
            secret_type: "kubernetes.io/tls".to_string(),
            string_data: string_data.into_iter().collect(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ClusterObject::ConfigMap { name, .. } | ClusterObject::Secret { name, .. } => name,
            ClusterObject::HelmChart(chart) => &chart.name,
        }
    }

    /// The object as the cluster API expects it.
    pub fn manifest(&self) -> Result<Value> {
        let manifest = match self {
            ClusterObject::ConfigMap {
                name,
                namespace,
                data,
            } => json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": name, "namespace": namespace},
                "data": data,
            }),
            ClusterObject::Secret {
                name,
                namespace,
                secret_type,
                string_data,
            } => json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": name, "namespace": namespace},
                "type": secret_type,
                "stringData": string_data,
            }),
            ClusterObject::HelmChart(chart) => {
                let mut spec = json!({
                    "chart": chart.chart,
                    "version": chart.version,
                    "targetNamespace": chart.target_namespace,
                    "createNamespace": true,
                });
                if !chart.values.is_null() {
                    let values = serde_yaml::to_string(&chart.values)
                        .with_context(|| format!("failed to serialize values of chart `{}`", chart.name))?;
                    spec["valuesContent"] = Value::String(values);
                }
                if let Some(ca) = &chart.repo_ca {
                    spec["repoCA"] = Value::String(ca.clone());
                }
                json!({
                    "apiVersion": "helm.cattle.io/v1",
                    "kind": "HelmChart",
                    "metadata": {"name": chart.name, "namespace": CHART_NAMESPACE},
                    "spec": spec,
                })
            }
        };
        Ok(manifest)
    }
}

/// Serialize objects into one `---`-separated YAML stream.
pub fn render_stream(objects: &[ClusterObject]) -> Result<String> {
    let docs = objects
        .iter()
        .map(|o| o.manifest())
        .collect::<Result<Vec<_>>>()?;
    join_documents(&docs)
}

fn join_documents<T: Serialize>(docs: &[T]) -> Result<String> {
    let mut out = String::new();
    for doc in docs {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(doc).context("failed to serialize cluster object")?);
    }
    Ok(out)
}

/// Minimal header every manifest document must carry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectHeader {
    api_version: String,
    kind: String,
    metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    name: String,
}

/// Parse a rendered multi-document manifest, check each document is an
/// object, and re-serialize it in canonical form. Empty documents are dropped.
pub fn normalize_stream(source: &str, origin: &str) -> Result<String> {
    let mut docs: Vec<serde_yaml::Value> = Vec::new();

    for (i, de) in serde_yaml::Deserializer::from_str(source).enumerate() {
        let doc = serde_yaml::Value::deserialize(de)
            .with_context(|| format!("{}: document {} is not valid YAML", origin, i + 1))?;
        if doc.is_null() {
            continue;
        }
        let header: ObjectHeader = serde_yaml::from_value(doc.clone())
            .with_context(|| format!("{}: document {} is not a cluster object", origin, i + 1))?;
        if header.api_version.is_empty() || header.kind.is_empty() || header.metadata.name.is_empty() {
            bail!(
                "{}: document {} needs apiVersion, kind and metadata.name",
                origin,
                i + 1
            );
        }
        docs.push(doc);
    }

    join_documents(&docs)
}
