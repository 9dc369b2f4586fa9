//! The DNS-SD record graph.
//!
//! Nodes are domain names holding the records received for that name;
//! edges follow DNS references (PTR rdata and SRV targets). Nodes are
//! identified by name and edges resolved through the owning map, never by
//! direct pointers. A node survives only while it is reachable from a
//! user-tracked root; orphaned nodes are collected immediately, cascading
//! through their children.

use crate::dnssd::endpoint::InstanceEndpoint;
use crate::dnssd::keys::InstanceKey;
use crate::dnssd::txt::TxtRecord;
use crate::errors::{Error, Result};
use crate::message::MdnsRecord;
use crate::name::DomainName;
use crate::resource::{Rdata, Srv};
use crate::types::{DnsType, RecordChangedEvent};
use std::collections::{HashMap, HashSet};
use std::net::{SocketAddrV4, SocketAddrV6};

/// Which records to collect when materialising endpoints at a node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DomainGroup {
    /// The node holds A/AAAA records (a host name).
    Address,
    /// The node holds SRV and TXT records (an instance name).
    SrvAndTxt,
    /// The node holds PTR records (a service type name).
    Ptr,
}

/// The group a record of the given type belongs to, if it participates in
/// endpoint materialisation.
pub fn domain_group_for(dns_type: DnsType) -> Option<DomainGroup> {
    match dns_type {
        DnsType::A | DnsType::AAAA => Some(DomainGroup::Address),
        DnsType::SRV | DnsType::TXT => Some(DomainGroup::SrvAndTxt),
        DnsType::PTR => Some(DomainGroup::Ptr),
        _ => None,
    }
}

#[derive(Default)]
struct Node {
    records: Vec<MdnsRecord>,
    parents: Vec<DomainName>,
    children: Vec<DomainName>,
}

impl Node {
    fn rdata(&self, dns_type: DnsType) -> Option<&Rdata> {
        self.records
            .iter()
            .find(|record| record.dns_type() == dns_type)
            .map(|record| record.rdata())
    }
}

/// Callback invoked once per node created or deleted during one graph
/// operation. Scoped to that call; the graph holds no callback state.
pub type DomainChangeCallback<'a> = &'a mut dyn FnMut(&DomainName);

/// See the module documentation.
pub struct DnsDataGraph {
    network_interface: u32,
    nodes: HashMap<DomainName, Node>,
    tracked_roots: HashSet<DomainName>,
}

impl DnsDataGraph {
    pub fn new(network_interface: u32) -> DnsDataGraph {
        DnsDataGraph {
            network_interface,
            nodes: HashMap::new(),
            tracked_roots: HashSet::new(),
        }
    }

    /// Creates a root node. `on_start_tracking` fires once for the new
    /// node.
    pub fn start_tracking(
        &mut self,
        domain: &DomainName,
        on_start_tracking: DomainChangeCallback,
    ) -> Result<()> {
        if self.nodes.contains_key(domain) {
            return Err(Error::ItemAlreadyExists(domain.to_string()));
        }
        self.nodes.insert(domain.clone(), Node::default());
        self.tracked_roots.insert(domain.clone());
        on_start_tracking(domain);
        Ok(())
    }

    /// Removes a root node, cascading deletion to every node whose last
    /// incoming edge came from it. `on_stop_tracking` fires once per
    /// deleted node.
    pub fn stop_tracking(
        &mut self,
        domain: &DomainName,
        on_stop_tracking: DomainChangeCallback,
    ) -> Result<()> {
        if !self.tracked_roots.remove(domain) {
            return Err(Error::ItemNotFound(domain.to_string()));
        }
        let node = self.nodes.get(domain).ok_or_else(|| {
            Error::ItemNotFound(domain.to_string())
        })?;
        debug_assert!(node.parents.is_empty());
        self.delete_node(domain.clone(), on_stop_tracking);
        Ok(())
    }

    pub fn is_tracked(&self, domain: &DomainName) -> bool {
        self.nodes.contains_key(domain)
    }

    /// Routes a record change to the node owning the record's name.
    /// Returns [`Error::OperationCancelled`] when that node is untracked
    /// (the change raced with `stop_tracking`).
    ///
    /// PTR records may exist in multiples at one node; every other type is
    /// a singleton per node. PTR and SRV changes create or remove child
    /// edges, firing `on_start_tracking`/`on_stop_tracking` for nodes the
    /// edge change creates or orphans.
    pub fn apply_record_change(
        &mut self,
        record: MdnsRecord,
        event: RecordChangedEvent,
        on_start_tracking: DomainChangeCallback,
        on_stop_tracking: DomainChangeCallback,
    ) -> Result<()> {
        let name = record.name().clone();
        let Some(node) = self.nodes.get_mut(&name) else {
            return Err(Error::OperationCancelled);
        };

        // PTR records are allowed to have duplicates; other types are not.
        let child_name = match record.rdata() {
            Rdata::PTR(target) => Some(target.clone()),
            Rdata::SRV(srv) => Some(srv.target.clone()),
            _ => None,
        };
        let index = if record.dns_type() == DnsType::PTR {
            node.records
                .iter()
                .position(|r| r.matches_key(&record) && r.rdata() == record.rdata())
        } else {
            node.records
                .iter()
                .position(|r| r.dns_type() == record.dns_type())
        };

        match event {
            RecordChangedEvent::Created => {
                if index.is_some() {
                    return Err(Error::ItemAlreadyExists(name.to_string()));
                }
                node.records.push(record);
            }
            RecordChangedEvent::Updated => {
                let Some(index) = index else {
                    return Err(Error::ItemNotFound(name.to_string()));
                };
                node.records[index] = record;
            }
            RecordChangedEvent::Expired => {
                let Some(index) = index else {
                    return Err(Error::ItemNotFound(name.to_string()));
                };
                node.records.remove(index);
            }
        }

        if let Some(child) = child_name {
            match event {
                RecordChangedEvent::Created => self.add_child(&name, child, on_start_tracking),
                RecordChangedEvent::Expired => self.remove_child(&name, &child, on_stop_tracking),
                RecordChangedEvent::Updated => {}
            }
        }

        Ok(())
    }

    /// Materialises every coherent (SRV, TXT, A/AAAA) triple reachable
    /// from `name`, interpreted according to `domain_group`. Incoherent
    /// combinations (e.g. an SRV whose target is not the address node) are
    /// skipped.
    pub fn create_endpoints(
        &self,
        domain_group: DomainGroup,
        name: &DomainName,
    ) -> Result<Vec<InstanceEndpoint>> {
        let Some(target_node) = self.nodes.get(name) else {
            return Ok(Vec::new());
        };

        // One of these two lists has at most one element, so the nested
        // iteration below stays small.
        let (srv_and_txt_nodes, address_nodes): (Vec<DomainName>, Vec<DomainName>) =
            match domain_group {
                DomainGroup::Address => {
                    if target_node.rdata(DnsType::A).is_none()
                        && target_node.rdata(DnsType::AAAA).is_none()
                    {
                        return Ok(Vec::new());
                    }
                    (target_node.parents.clone(), vec![name.clone()])
                }
                DomainGroup::SrvAndTxt => {
                    if target_node.rdata(DnsType::SRV).is_none()
                        || target_node.rdata(DnsType::TXT).is_none()
                    {
                        return Ok(Vec::new());
                    }
                    (vec![name.clone()], target_node.children.clone())
                }
                DomainGroup::Ptr => {
                    let mut endpoints = Vec::new();
                    let mut seen = HashSet::new();
                    for child in &target_node.children {
                        if !seen.insert(child.clone()) {
                            continue;
                        }
                        endpoints
                            .extend(self.create_endpoints(DomainGroup::SrvAndTxt, child)?);
                    }
                    return Ok(endpoints);
                }
            };

        let mut endpoints = Vec::new();
        for srv_and_txt in &srv_and_txt_nodes {
            for address in &address_nodes {
                let Some(st_node) = self.nodes.get(srv_and_txt) else {
                    continue;
                };
                let Some(addr_node) = self.nodes.get(address) else {
                    continue;
                };

                let srv = match st_node.rdata(DnsType::SRV) {
                    Some(Rdata::SRV(srv)) => srv,
                    _ => continue,
                };
                if srv.target != *address {
                    continue;
                }
                let txt = match st_node.rdata(DnsType::TXT) {
                    Some(Rdata::TXT(entries)) => entries,
                    _ => continue,
                };
                let a = match addr_node.rdata(DnsType::A) {
                    Some(Rdata::A(ip)) => Some(*ip),
                    _ => None,
                };
                let aaaa = match addr_node.rdata(DnsType::AAAA) {
                    Some(Rdata::AAAA(ip)) => Some(*ip),
                    _ => None,
                };
                if a.is_none() && aaaa.is_none() {
                    continue;
                }

                match self.make_endpoint(srv_and_txt, srv, txt, a, aaaa) {
                    Ok(endpoint) => endpoints.push(endpoint),
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(endpoints)
    }

    fn make_endpoint(
        &self,
        instance_name: &DomainName,
        srv: &Srv,
        txt_entries: &[Vec<u8>],
        a: Option<std::net::Ipv4Addr>,
        aaaa: Option<std::net::Ipv6Addr>,
    ) -> Result<InstanceEndpoint> {
        let txt = TxtRecord::from_wire(txt_entries)?;
        let key = InstanceKey::from_name(instance_name)?;
        InstanceEndpoint::new(
            key.instance_id,
            key.service_id,
            key.domain_id,
            txt,
            a.map(|ip| SocketAddrV4::new(ip, srv.port)),
            aaaa.map(|ip| SocketAddrV6::new(ip, srv.port, 0, 0)),
            self.network_interface,
        )
    }

    fn add_child(&mut self, parent: &DomainName, child: DomainName, on_start: DomainChangeCallback) {
        if !self.nodes.contains_key(&child) {
            self.nodes.insert(child.clone(), Node::default());
            on_start(&child);
        }
        self.nodes
            .get_mut(parent)
            .expect("parent exists")
            .children
            .push(child.clone());
        self.nodes
            .get_mut(&child)
            .expect("just ensured")
            .parents
            .push(parent.clone());
    }

    fn remove_child(&mut self, parent: &DomainName, child: &DomainName, on_stop: DomainChangeCallback) {
        let Some(parent_node) = self.nodes.get_mut(parent) else {
            return;
        };
        if let Some(index) = parent_node.children.iter().position(|c| c == child) {
            parent_node.children.remove(index);
        }

        let Some(child_node) = self.nodes.get_mut(child) else {
            return;
        };
        if let Some(index) = child_node.parents.iter().position(|p| p == parent) {
            child_node.parents.remove(index);
        }

        let orphaned = child_node.parents.is_empty();
        if orphaned && child != parent && !self.tracked_roots.contains(child) {
            self.delete_node(child.clone(), on_stop);
        }
    }

    /// Deletes a node, unlinking its children first; children orphaned by
    /// the unlinking are deleted too, so `on_stop` fires deepest-first.
    fn delete_node(&mut self, name: DomainName, on_stop: DomainChangeCallback) {
        let Some(node) = self.nodes.remove(&name) else {
            return;
        };

        for child in node.children {
            let Some(child_node) = self.nodes.get_mut(&child) else {
                continue;
            };
            if let Some(index) = child_node.parents.iter().position(|p| p == &name) {
                child_node.parents.remove(index);
            }
            let orphaned = child_node.parents.is_empty();
            if orphaned && child != name && !self.tracked_roots.contains(&child) {
                self.delete_node(child, on_stop);
            }
        }

        on_stop(&name);
    }
}
