//! Namespace tree over a descriptor pool, and service discovery within a
//! package.
//!
//! Packages become namespaces, services become service nodes, and
//! top-level messages and enums become format nodes. Discovery is a
//! depth-first walk in declaration order that collects service nodes and
//! skips formats.

use prost_reflect::{DescriptorPool, ServiceDescriptor};

use crate::errors::{DefinitionError, Result};

/// A node in the namespace tree.
#[derive(Debug, Clone)]
pub enum Node {
    /// A package segment, with its children in declaration order.
    Namespace(Vec<(String, Node)>),
    /// A service definition.
    Service(ServiceDescriptor),
    /// A message or enum definition.
    Format,
}

/// A discovered service and its dotted name relative to the package.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    /// Name relative to the looked-up package, e.g. `HeroService`.
    pub name: String,
    /// The service descriptor.
    pub service: ServiceDescriptor,
}

impl Node {
    /// Build the tree for every definition in `pool`.
    pub fn from_pool(pool: &DescriptorPool) -> Self {
        let mut root = Self::Namespace(Vec::new());
        for service in pool.services() {
            root.insert(service.full_name(), Self::Service(service.clone()));
        }
        for message in pool.all_messages() {
            if message.parent_message().is_none() {
                root.insert(message.full_name(), Self::Format);
            }
        }
        for enumeration in pool.all_enums() {
            if enumeration.parent_message().is_none() {
                root.insert(enumeration.full_name(), Self::Format);
            }
        }
        root
    }

    fn insert(&mut self, full_name: &str, leaf: Self) {
        let mut node = self;
        let mut segments = full_name.split('.').peekable();
        while let Some(segment) = segments.next() {
            let Self::Namespace(children) = node else {
                return;
            };
            let index = match children.iter().position(|(name, _)| name == segment) {
                Some(index) => index,
                None => {
                    let child = if segments.peek().is_some() {
                        Self::Namespace(Vec::new())
                    } else {
                        leaf.clone()
                    };
                    children.push((segment.to_owned(), child));
                    children.len() - 1
                }
            };
            node = &mut children[index].1;
        }
    }

    /// Walk to the namespace named by the dotted `package`.
    pub fn lookup_package(&self, package: &str) -> Result<&Self> {
        let not_found = || DefinitionError::PackageNotFound(package.to_owned());
        if package.is_empty() {
            return Err(not_found());
        }
        let mut node = self;
        for segment in package.split('.') {
            let Self::Namespace(children) = node else {
                return Err(not_found());
            };
            node = children
                .iter()
                .find(|(name, _)| name == segment)
                .map(|(_, child)| child)
                .ok_or_else(not_found)?;
        }
        match node {
            Self::Namespace(_) => Ok(node),
            _ => Err(not_found()),
        }
    }

    /// Every service below this node, depth first.
    pub fn collect_services(&self) -> Vec<ServiceEntry> {
        let mut services = Vec::new();
        self.collect_into("", &mut services);
        services
    }

    fn collect_into(&self, prefix: &str, out: &mut Vec<ServiceEntry>) {
        let Self::Namespace(children) = self else {
            return;
        };
        for (name, child) in children {
            let dotted = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            match child {
                Self::Service(service) => out.push(ServiceEntry {
                    name: dotted,
                    service: service.clone(),
                }),
                Self::Namespace(_) => child.collect_into(&dotted, out),
                Self::Format => {}
            }
        }
    }
}
