// src/config.rs

//! Cluster topology: the TOML document produced by `lustra simple_config`,
//! canonical service naming, and derivation of this host's responsibilities.
//!
//! The topology is immutable once loaded; every reader shares the same
//! instance without synchronization.

use crate::core::errors::AgentError;
use crate::core::mgr::MgrCommand;
use serde::Deserialize;

/// Largest permitted target index; names encode it as four hex digits.
pub const MAX_TARGET_INDEX: i64 = 0xffff;

/// Kinds of mountable targets with numbered indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Mdt,
    Ost,
}

impl TargetKind {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Mdt => "MDT",
            Self::Ost => "OST",
        }
    }
}

/// Builds the canonical service name, e.g. `lustre0-OST000a`. Indices
/// outside `[0, 0xffff]` reject the configuration.
pub fn target_service_name(
    fsname: &str,
    kind: TargetKind,
    index: i64,
) -> Result<String, AgentError> {
    if !(0..=MAX_TARGET_INDEX).contains(&index) {
        return Err(AgentError::FatalConfig(format!(
            "{} index {index} of filesystem '{fsname}' is outside [0, 0xffff]",
            kind.tag()
        )));
    }
    Ok(format!("{fsname}-{}{index:04x}", kind.tag()))
}

/// One physical placement of a service on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Canonical name of the service this instance belongs to.
    pub service_name: String,
    pub hostname: String,
    pub device: String,
    pub network_id: String,
    pub mountpoint: String,
}

/// One storage node of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshHost {
    pub hostname: String,
    /// A standalone host participates only on itself and is skipped by the
    /// shared monitor ring of every other host.
    pub standalone: bool,
}

/// A numbered target (MDT or OST) of one filesystem.
#[derive(Debug, Clone)]
pub struct Target {
    pub index: i64,
    pub service_name: String,
    pub instances: Vec<ServiceInstance>,
}

/// One Lustre filesystem and its targets.
#[derive(Debug, Clone)]
pub struct Filesystem {
    pub fsname: String,
    pub mdts: Vec<Target>,
    pub osts: Vec<Target>,
}

/// A management service, named by an externally supplied identifier.
#[derive(Debug, Clone)]
pub struct ManagementService {
    pub mgs_id: String,
    pub instances: Vec<ServiceInstance>,
}

/// The cluster topology, as produced by the management CLI.
#[derive(Debug, Clone)]
pub struct Topology {
    pub filesystems: Vec<Filesystem>,
    pub mgs: Vec<ManagementService>,
    pub hosts: Vec<SshHost>,
}

// Wire schema of `lustra simple_config` output. The field names are fixed
// externally; everything else about the shapes is private to this module.

#[derive(Debug, Deserialize)]
struct TopologyDoc {
    #[serde(default)]
    filesystems: Vec<FilesystemDoc>,
    #[serde(default)]
    mgs_list: Vec<MgsDoc>,
    #[serde(default)]
    hosts: Vec<HostDoc>,
}

#[derive(Debug, Deserialize)]
struct FilesystemDoc {
    fsname: String,
    #[serde(default)]
    mdts: Vec<TargetDoc>,
    #[serde(default)]
    osts: Vec<TargetDoc>,
}

#[derive(Debug, Deserialize)]
struct TargetDoc {
    index: i64,
    #[serde(default)]
    instances: Vec<InstanceDoc>,
}

#[derive(Debug, Deserialize)]
struct InstanceDoc {
    hostname: String,
    device: String,
    nid: String,
    mnt: String,
}

#[derive(Debug, Deserialize)]
struct MgsDoc {
    mgs_id: String,
    #[serde(default)]
    instances: Vec<InstanceDoc>,
}

#[derive(Debug, Deserialize)]
struct HostDoc {
    hostname: String,
    #[serde(default)]
    standalone: bool,
}

impl InstanceDoc {
    fn into_instance(self, service_name: &str) -> ServiceInstance {
        ServiceInstance {
            service_name: service_name.to_string(),
            hostname: self.hostname,
            device: self.device,
            network_id: self.nid,
            mountpoint: self.mnt,
        }
    }
}

impl Topology {
    /// Parses and validates one topology document.
    pub fn from_toml(text: &str) -> Result<Self, AgentError> {
        let doc: TopologyDoc = toml::from_str(text)
            .map_err(|e| AgentError::FatalConfig(format!("unparseable topology: {e}")))?;

        let hosts: Vec<SshHost> = doc
            .hosts
            .into_iter()
            .map(|h| SshHost {
                hostname: h.hostname,
                standalone: h.standalone,
            })
            .collect();

        let mut filesystems = Vec::with_capacity(doc.filesystems.len());
        for fs_doc in doc.filesystems {
            let mdts = convert_targets(&fs_doc.fsname, TargetKind::Mdt, fs_doc.mdts)?;
            let osts = convert_targets(&fs_doc.fsname, TargetKind::Ost, fs_doc.osts)?;
            filesystems.push(Filesystem {
                fsname: fs_doc.fsname,
                mdts,
                osts,
            });
        }

        let mgs = doc
            .mgs_list
            .into_iter()
            .map(|m| {
                let instances = m
                    .instances
                    .into_iter()
                    .map(|i| i.into_instance(&m.mgs_id))
                    .collect();
                ManagementService {
                    mgs_id: m.mgs_id,
                    instances,
                }
            })
            .collect();

        let topology = Self {
            filesystems,
            mgs,
            hosts,
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Every instance must be placed on a declared host.
    fn validate(&self) -> Result<(), AgentError> {
        for instance in self.all_instances() {
            if !self.has_host(&instance.hostname) {
                return Err(AgentError::FatalConfig(format!(
                    "instance of '{}' is placed on undeclared host '{}'",
                    instance.service_name, instance.hostname
                )));
            }
        }
        Ok(())
    }

    pub fn has_host(&self, hostname: &str) -> bool {
        self.hosts.iter().any(|h| h.hostname == hostname)
    }

    /// Every instance across filesystems and management services.
    pub fn all_instances(&self) -> impl Iterator<Item = &ServiceInstance> {
        self.filesystems
            .iter()
            .flat_map(|fs| fs.mdts.iter().chain(fs.osts.iter()))
            .flat_map(|t| t.instances.iter())
            .chain(self.mgs.iter().flat_map(|m| m.instances.iter()))
    }

    /// The instances this host is a hosting candidate for.
    pub fn local_instances(&self, hostname: &str) -> Vec<ServiceInstance> {
        self.all_instances()
            .filter(|i| i.hostname == hostname)
            .cloned()
            .collect()
    }

    /// The monitor ring: up to `fanout` successors of the local host on the
    /// hostname-sorted candidate list, wrapping around. Standalone hosts do
    /// not participate except on themselves. Fails when the local host is
    /// not a candidate at all.
    pub fn neighbour_hosts(
        &self,
        hostname: &str,
        fanout: usize,
    ) -> Result<Vec<SshHost>, AgentError> {
        let mut candidates: Vec<&SshHost> = self
            .hosts
            .iter()
            .filter(|h| !h.standalone || h.hostname == hostname)
            .collect();
        candidates.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        let Some(local_pos) = candidates.iter().position(|h| h.hostname == hostname) else {
            return Err(AgentError::FatalConfig(format!(
                "local host '{hostname}' is not part of the cluster topology"
            )));
        };

        let mut picked: Vec<SshHost> = Vec::with_capacity(fanout.min(candidates.len()));
        for offset in 1..candidates.len() {
            if picked.len() == fanout {
                break;
            }
            let candidate = candidates[(local_pos + offset) % candidates.len()];
            if candidate.hostname == hostname {
                continue;
            }
            picked.push(candidate.clone());
        }

        // The wrap-around selection is re-sorted before use.
        picked.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(picked)
    }
}

fn convert_targets(
    fsname: &str,
    kind: TargetKind,
    docs: Vec<TargetDoc>,
) -> Result<Vec<Target>, AgentError> {
    let mut targets = Vec::with_capacity(docs.len());
    for doc in docs {
        let service_name = target_service_name(fsname, kind, doc.index)?;
        let instances = doc
            .instances
            .into_iter()
            .map(|i| i.into_instance(&service_name))
            .collect();
        targets.push(Target {
            index: doc.index,
            service_name,
            instances,
        });
    }
    Ok(targets)
}

/// Loads the topology by invoking `lustra simple_config`.
pub struct ConfigLoader {
    mgr: MgrCommand,
}

impl ConfigLoader {
    pub fn new(mgr: MgrCommand) -> Self {
        Self { mgr }
    }

    pub async fn load(&self) -> Result<Topology, AgentError> {
        let report = self
            .mgr
            .run(&["simple_config"])
            .await
            .map_err(|e| AgentError::FatalConfig(format!("cannot obtain topology: {e}")))?;

        if !report.success {
            return Err(AgentError::FatalConfig(format!(
                "'{}' exited with {}: stdout='{}' stderr='{}'",
                report.command_line,
                report.exit_label(),
                report.stdout_escaped(),
                report.stderr_escaped()
            )));
        }

        Topology::from_toml(&report.stdout).map_err(|e| {
            AgentError::FatalConfig(format!(
                "{e}: stdout='{}' stderr='{}'",
                report.stdout_escaped(),
                report.stderr_escaped()
            ))
        })
    }
}
