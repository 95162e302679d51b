use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

use crate::error::{BatchError, Result};
use crate::scheduler::job::ResourceClass;

/// How a free resource is chosen among the resources of one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationPolicy {
    /// Lowest free resource id first.
    #[default]
    FirstFree,
    /// Rotate through the class's resources, skipping busy ones.
    RoundRobin,
}

/// A physical execution target declared in the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub id: String,
    pub class: ResourceClass,
}

impl ResourceSpec {
    pub fn new(id: impl Into<String>, class: ResourceClass) -> Self {
        Self {
            id: id.into(),
            class,
        }
    }
}

/// Resource state tracking
#[derive(Debug, Clone)]
pub struct Resource {
    pub id: String,
    pub class: ResourceClass,
    pub lease_holder: Option<Uuid>,
}

/// Fixed, sorted resource ids of one class plus the round-robin cursor.
#[derive(Debug)]
struct ClassSlots {
    ids: Vec<String>,
    cursor: usize,
}

/// Owns the exclusive execution targets and their leases.
///
/// At most one job holds a lease on a resource at a time. The pool is not
/// synchronised itself; the dispatcher owns it and serialises every access.
#[derive(Debug)]
pub struct ResourcePool {
    resources: HashMap<String, Resource>,
    classes: HashMap<ResourceClass, ClassSlots>,
    policy: AllocationPolicy,
}

impl ResourcePool {
    pub fn new(specs: &[ResourceSpec], policy: AllocationPolicy) -> Result<Self> {
        let mut resources = HashMap::new();
        let mut classes: HashMap<ResourceClass, ClassSlots> = HashMap::new();

        for spec in specs {
            if resources.contains_key(&spec.id) {
                return Err(BatchError::InvalidResourceSpec(format!(
                    "duplicate resource id {}",
                    spec.id
                )));
            }
            resources.insert(
                spec.id.clone(),
                Resource {
                    id: spec.id.clone(),
                    class: spec.class.clone(),
                    lease_holder: None,
                },
            );
            classes
                .entry(spec.class.clone())
                .or_insert_with(|| ClassSlots {
                    ids: Vec::new(),
                    cursor: 0,
                })
                .ids
                .push(spec.id.clone());
        }

        for slots in classes.values_mut() {
            slots.ids.sort();
        }

        tracing::info!(
            resources = resources.len(),
            classes = classes.len(),
            policy = ?policy,
            "Resource pool initialised"
        );

        Ok(Self {
            resources,
            classes,
            policy,
        })
    }

    pub fn policy(&self) -> AllocationPolicy {
        self.policy
    }

    pub fn has_class(&self, class: &ResourceClass) -> bool {
        self.classes.contains_key(class)
    }

    /// Lease a free resource of `class` to `job_id`.
    /// Returns the resource id, or `None` if every resource of the class is busy.
    pub fn allocate(&mut self, job_id: Uuid, class: &ResourceClass) -> Option<String> {
        let slots = self.classes.get_mut(class)?;
        let resources = &self.resources;
        let is_free = |id: &String| {
            resources
                .get(id)
                .is_some_and(|r| r.lease_holder.is_none())
        };

        let selected = match self.policy {
            AllocationPolicy::FirstFree => slots.ids.iter().position(is_free),
            AllocationPolicy::RoundRobin => {
                let len = slots.ids.len();
                (0..len)
                    .map(|step| (slots.cursor + step) % len)
                    .find(|&idx| is_free(&slots.ids[idx]))
            }
        };

        let Some(idx) = selected else {
            tracing::debug!(job_id = %job_id, class = %class, "No free resource for job");
            return None;
        };

        if self.policy == AllocationPolicy::RoundRobin {
            slots.cursor = (idx + 1) % slots.ids.len();
        }

        let resource_id = slots.ids[idx].clone();
        if let Some(resource) = self.resources.get_mut(&resource_id) {
            resource.lease_holder = Some(job_id);
        }
        tracing::info!(job_id = %job_id, resource = %resource_id, class = %class, "Resource allocated");
        Some(resource_id)
    }

    /// Clear the lease on a resource. Returns false if the resource is unknown.
    pub fn release(&mut self, resource_id: &str) -> bool {
        match self.resources.get_mut(resource_id) {
            Some(resource) => {
                let previous = resource.lease_holder.take();
                tracing::info!(
                    resource = %resource_id,
                    previous_job = ?previous,
                    "Resource released"
                );
                true
            }
            None => {
                tracing::warn!(resource = %resource_id, "Release requested for unknown resource");
                false
            }
        }
    }

    /// True only if `job_id` currently holds the lease on `resource_id`.
    pub fn validate_ownership(&self, job_id: Uuid, resource_id: &str) -> bool {
        self.resources
            .get(resource_id)
            .is_some_and(|r| r.lease_holder == Some(job_id))
    }

    /// Lease map snapshot: resource id to holder.
    pub fn status(&self) -> BTreeMap<String, Option<Uuid>> {
        self.resources
            .values()
            .map(|r| (r.id.clone(), r.lease_holder))
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.resources
            .values()
            .filter(|r| r.lease_holder.is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
