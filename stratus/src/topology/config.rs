use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use crate::err::ConfigErr;
use crate::topology::defaults::BlobStoreDefaults;
use crate::topology::{
    ceil_percent, parse, BlobStoreSettings, InstanceGroup, RoleConfig, RoleSet, StateStoreKind,
    Topology, DEFAULT_MAX_CONCURRENT_LAUNCHES, DEFAULT_MAX_STARTUP_RETRIES,
};

/// The raw, unvalidated topology as it appears in a yaml file.  Call
/// [ProtoTopology::create] to turn it into a [Topology]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProtoTopology {
    pub cluster_name: Option<String>,
    pub service_name: Option<String>,
    pub cluster_user: Option<String>,
    pub instance_templates: Option<String>,
    #[serde(alias = "instance-templates-max-percent-failures")]
    pub instance_templates_min_percent_success: Option<String>,
    pub instance_templates_minimum_number_of_instances: Option<String>,
    pub max_startup_retries: Option<u32>,
    pub max_concurrent_launches: Option<usize>,
    pub terminate_all_on_launch_failure: Option<bool>,
    pub provider: Option<String>,
    pub endpoint: Option<String>,
    pub identity: Option<String>,
    pub credential: Option<String>,
    pub blobstore_provider: Option<String>,
    pub blobstore_endpoint: Option<String>,
    pub blobstore_identity: Option<String>,
    pub blobstore_credential: Option<String>,
    pub blobstore_location_id: Option<String>,
    pub blobstore_cache_container: Option<String>,
    pub state_store: Option<StateStoreKind>,
    pub state_store_container: Option<String>,
    pub state_store_blob: Option<String>,
    pub client_cidrs: Vec<String>,
    /// ports keyed by role.  The key `all` (or an empty key) applies to every instance
    pub firewall_rules: BTreeMap<String, Vec<u16>>,
    pub env: BTreeMap<String, String>,
    pub roles: BTreeMap<String, RoleConfig>,
    pub auto_hostname_prefix: Option<String>,
    pub auto_hostname_suffix: Option<String>,
    pub jdk_install_url: Option<String>,
    pub kerberos_realm: Option<String>,
}

impl ProtoTopology {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigErr> {
        serde_yaml::from_str(yaml).map_err(ConfigErr::parse)
    }

    pub fn create(self, defaults: &BlobStoreDefaults) -> Result<Topology, ConfigErr> {
        let cluster_name = self
            .cluster_name
            .ok_or_else(|| ConfigErr::missing("cluster-name"))?;
        let provider = self.provider.ok_or_else(|| ConfigErr::missing("provider"))?;
        let templates = self
            .instance_templates
            .ok_or_else(|| ConfigErr::missing("instance-templates"))?;

        let percents = overrides(
            "instance-templates-min-percent-success",
            self.instance_templates_min_percent_success.as_ref(),
        )?;
        let minimums = overrides(
            "instance-templates-minimum-number-of-instances",
            self.instance_templates_minimum_number_of_instances.as_ref(),
        )?;

        let mut groups = vec![];
        for (target, roles) in parse::counted(templates.as_str())? {
            let percent = match percents.get(&roles) {
                None => 100,
                Some(percent) => u8::try_from(*percent).map_err(|_| {
                    ConfigErr::group(&roles, format!("minimum success percentage {} is not within 0..=100", percent))
                })?,
            };
            let min_instances = match minimums.get(&roles) {
                None => ceil_percent(target, percent.min(100)),
                Some(min) => *min,
            };
            let group = InstanceGroup {
                roles,
                target,
                min_percent_success: percent,
                min_instances,
            };
            groups.push(group);
        }

        for roles in percents.keys().chain(minimums.keys()) {
            if !groups.iter().any(|group| &group.roles == roles) {
                return Err(ConfigErr::group(
                    roles,
                    "an override names an instance group that is not declared in instance-templates",
                ));
            }
        }

        let blob_store = BlobStoreSettings {
            provider: self
                .blobstore_provider
                .or_else(|| defaults.lookup(provider.as_str())),
            endpoint: self.blobstore_endpoint,
            identity: self.blobstore_identity,
            credential: self.blobstore_credential,
            location_id: self.blobstore_location_id,
            cache_container: self.blobstore_cache_container,
        };

        let env = self
            .env
            .into_iter()
            .map(|(key, value)| (key.to_uppercase(), value))
            .collect();

        let topology = Topology {
            cluster_name,
            service_name: self.service_name,
            cluster_user: self.cluster_user,
            groups,
            max_startup_retries: self
                .max_startup_retries
                .unwrap_or(DEFAULT_MAX_STARTUP_RETRIES),
            max_concurrent_launches: self
                .max_concurrent_launches
                .unwrap_or(DEFAULT_MAX_CONCURRENT_LAUNCHES),
            terminate_all_on_launch_failure: self.terminate_all_on_launch_failure.unwrap_or(true),
            provider,
            endpoint: self.endpoint,
            identity: self.identity,
            credential: self.credential,
            blob_store,
            state_store: self.state_store.unwrap_or_default(),
            state_store_container: self.state_store_container,
            state_store_blob: self.state_store_blob,
            client_cidrs: self.client_cidrs,
            firewall_rules: self.firewall_rules,
            env,
            roles: self.roles,
            auto_hostname_prefix: self.auto_hostname_prefix,
            auto_hostname_suffix: self.auto_hostname_suffix,
            jdk_install_url: self.jdk_install_url,
            kerberos_realm: self.kerberos_realm,
        };

        topology.validate()?;
        Ok(topology)
    }
}

fn overrides(key: &str, value: Option<&String>) -> Result<BTreeMap<RoleSet, u32>, ConfigErr> {
    let mut rtn = BTreeMap::new();
    if let Some(value) = value {
        for (number, roles) in parse::counted(value.as_str())? {
            if rtn.insert(roles.clone(), number).is_some() {
                return Err(ConfigErr::invalid(
                    key,
                    format!("instance group [{}] is listed twice", roles),
                ));
            }
        }
    }
    Ok(rtn)
}
