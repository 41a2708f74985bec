use crate::{
    registry::ServiceRegistry,
    service::{Attributes, DynProvider, MemberSpec, Rank},
};

/// A provider registered at link time via `inventory::submit!`.
/// - `provides`: type names published as `objectClass`; empty => untyped member.
/// - `attributes`: extra attributes; `rank` wins over any `service.ranking` among them.
pub struct ProviderRegistration {
    pub id: &'static str,
    pub rank: Rank,
    pub provides: fn() -> Vec<&'static str>,
    pub attributes: fn() -> Attributes,
    pub new_provider: fn() -> DynProvider,
}

inventory::collect!(ProviderRegistration);

impl ProviderRegistration {
    pub fn to_member(&self) -> MemberSpec {
        let spec = MemberSpec::new(self.id, (self.new_provider)())
            .attributes((self.attributes)())
            .rank(self.rank);
        (self.provides)()
            .into_iter()
            .fold(spec, |spec, name| spec.provides_name(name))
    }
}

/// Iterate all registrations
pub fn all() -> Vec<&'static ProviderRegistration> {
    inventory::iter::<ProviderRegistration>.into_iter().collect()
}

/// Look up a registration by id.
pub fn find(id: &str) -> Option<&'static ProviderRegistration> {
    inventory::iter::<ProviderRegistration>
        .into_iter()
        .find(|reg| reg.id == id)
}

pub fn no_attributes() -> Attributes {
    Attributes::new()
}

impl ServiceRegistry {
    /// Feeds every link-time registration through `member_appeared`; returns how many.
    pub fn publish_registered(&self) -> usize {
        let regs = all();
        for reg in &regs {
            tracing::debug!(service = reg.id, rank = reg.rank, "publishing registered provider");
            self.member_appeared(reg.to_member());
        }
        regs.len()
    }
}
