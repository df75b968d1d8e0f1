use base64::Engine;
use semver::Version;
use serde::Serialize;

/// Name of the cluster extension carrying the exec plugin configuration
pub const EXEC_EXTENSION_NAME: &str = "client.authentication.k8s.io/exec";
/// API version of the ExecCredential exchanged with the plugin
pub const EXEC_API_VERSION: &str = "client.authentication.k8s.io/v1beta1";

const EXEC_COMMAND: &str = "kubectl";
const EXEC_BASE_ARGS: [&str; 2] = ["gardenlogin", "get-client-certificate"];

/// First Kubernetes version whose client tooling passes cluster extensions to exec plugins
const EXTENSIONS_MIN_VERSION: Version = Version::new(1, 20, 0);

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing clusters")]
    MissingEndpoints,
    #[error("no name defined for cluster[{0}]")]
    EndpointNameMissing(usize),
    #[error("no api server host defined for cluster[{0}]")]
    EndpointHostMissing(usize),
    #[error("no namespace defined for kubeconfig request")]
    NamespaceMissing,
    #[error("no shoot name defined for kubeconfig request")]
    ShootNameMissing,
    #[error("no garden cluster identity defined for kubeconfig request")]
    GardenClusterIdentityMissing,
    #[error("could not parse kubernetes version {version} of shoot cluster: {source}")]
    InvalidKubernetesVersion {
        version: String,
        #[source]
        source: semver::Error,
    },
    #[error("could not serialize kubeconfig: {0}")]
    Serialization(#[from] serde_yaml::Error),
}

/// How the shoot reference reaches the exec plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeconfigFormat {
    /// Reference is attached to every cluster as an extension
    Current,
    /// Reference is passed as plugin arguments, for clients older than 1.20
    Legacy,
}

impl KubeconfigFormat {
    pub fn for_kubernetes_version(version: &str) -> Result<Self, BuildError> {
        let parsed = Version::parse(version.trim().trim_start_matches('v')).map_err(|source| {
            BuildError::InvalidKubernetesVersion {
                version: version.into(),
                source,
            }
        })?;

        // pre-releases never count as older, whatever their core version
        Ok(if parsed.pre.is_empty() && parsed < EXTENSIONS_MIN_VERSION {
            Self::Legacy
        } else {
            Self::Current
        })
    }
}

/// An address under which the kube-apiserver can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Name of the advertised address, eg `external`
    pub name: String,
    /// Host and optional port of the kube-apiserver
    pub host: String,
}

/// Everything needed to render a kubeconfig for one shoot
#[derive(Debug, Clone)]
pub struct KubeconfigRequest {
    /// Endpoints in advertised order; the first one becomes the current context
    pub endpoints: Vec<Endpoint>,
    /// PEM encoded cluster CA
    pub ca_cert: Vec<u8>,
    pub namespace: String,
    pub shoot_name: String,
    /// Identity of the garden cluster, resolved by the plugin to find the garden
    pub garden_cluster_identity: String,
}

impl KubeconfigRequest {
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.endpoints.is_empty() {
            return Err(BuildError::MissingEndpoints);
        }

        for (n, endpoint) in self.endpoints.iter().enumerate() {
            if endpoint.name.is_empty() {
                return Err(BuildError::EndpointNameMissing(n));
            }
            if endpoint.host.is_empty() {
                return Err(BuildError::EndpointHostMissing(n));
            }
        }

        if self.namespace.is_empty() {
            return Err(BuildError::NamespaceMissing);
        }
        if self.shoot_name.is_empty() {
            return Err(BuildError::ShootNameMissing);
        }
        if self.garden_cluster_identity.is_empty() {
            return Err(BuildError::GardenClusterIdentityMissing);
        }

        Ok(())
    }

    /// Renders the kubeconfig. The output only depends on the request and the format.
    pub fn build(&self, format: KubeconfigFormat) -> Result<String, BuildError> {
        self.validate()?;

        let auth_name = format!("{}--{}", self.namespace, self.shoot_name);
        let context_name = |endpoint: &Endpoint| format!("{auth_name}-{}", endpoint.name);

        let mut args: Vec<String> = EXEC_BASE_ARGS.iter().map(|a| a.to_string()).collect();
        let extensions = match format {
            KubeconfigFormat::Current => Some(vec![NamedExtension {
                name: EXEC_EXTENSION_NAME.into(),
                extension: ExecPluginConfig {
                    shoot_ref: ShootRef {
                        namespace: self.namespace.clone(),
                        name: self.shoot_name.clone(),
                    },
                    garden_cluster_identity: self.garden_cluster_identity.clone(),
                },
            }]),
            KubeconfigFormat::Legacy => {
                args.extend([
                    format!("--name={}", self.shoot_name),
                    format!("--namespace={}", self.namespace),
                    format!("--garden-cluster-identity={}", self.garden_cluster_identity),
                ]);
                None
            }
        };

        let ca_data = base64::engine::general_purpose::STANDARD.encode(&self.ca_cert);

        let config = Kubeconfig {
            api_version: "v1",
            kind: "Config",
            clusters: self
                .endpoints
                .iter()
                .map(|endpoint| NamedCluster {
                    name: context_name(endpoint),
                    cluster: Cluster {
                        server: format!("https://{}", endpoint.host),
                        certificate_authority_data: ca_data.clone(),
                        extensions: extensions.clone(),
                    },
                })
                .collect(),
            contexts: self
                .endpoints
                .iter()
                .map(|endpoint| NamedContext {
                    name: context_name(endpoint),
                    context: Context {
                        cluster: context_name(endpoint),
                        user: auth_name.clone(),
                    },
                })
                .collect(),
            current_context: context_name(&self.endpoints[0]),
            preferences: Preferences {},
            users: vec![NamedAuthInfo {
                name: auth_name.clone(),
                user: AuthInfo {
                    exec: ExecConfig {
                        api_version: EXEC_API_VERSION,
                        command: EXEC_COMMAND,
                        args,
                        provide_cluster_info: true,
                    },
                },
            }],
        };

        Ok(serde_yaml::to_string(&config)?)
    }
}

/// Payload of the exec extension, read by the plugin at credential fetch time
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecPluginConfig {
    pub shoot_ref: ShootRef,
    pub garden_cluster_identity: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ShootRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<NamedCluster>,
    contexts: Vec<NamedContext>,
    current_context: String,
    preferences: Preferences,
    users: Vec<NamedAuthInfo>,
}

#[derive(Serialize)]
struct Preferences {}

#[derive(Serialize)]
struct NamedCluster {
    name: String,
    cluster: Cluster,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct Cluster {
    server: String,
    certificate_authority_data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    extensions: Option<Vec<NamedExtension>>,
}

#[derive(Serialize, Clone)]
struct NamedExtension {
    name: String,
    extension: ExecPluginConfig,
}

#[derive(Serialize)]
struct NamedContext {
    name: String,
    context: Context,
}

#[derive(Serialize)]
struct Context {
    cluster: String,
    user: String,
}

#[derive(Serialize)]
struct NamedAuthInfo {
    name: String,
    user: AuthInfo,
}

#[derive(Serialize)]
struct AuthInfo {
    exec: ExecConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecConfig {
    api_version: &'static str,
    command: &'static str,
    args: Vec<String>,
    provide_cluster_info: bool,
}
