//! Macros for wiring object kinds into the [`Resource`](crate::Resource) trait.

/// Implement [`Resource`](crate::Resource) for a kind with a `metadata` field.
///
/// # Example
///
/// ```ignore
/// impl_resource!(VirtualMachine, "vmfleet.io/v1", "VirtualMachine", "virtualmachines");
/// ```
macro_rules! impl_resource {
    ($name:ident, $api_version:literal, $kind:literal, $plural:literal) => {
        impl $crate::Resource for $name {
            const API_VERSION: &'static str = $api_version;
            const KIND: &'static str = $kind;
            const PLURAL: &'static str = $plural;

            fn meta(&self) -> &$crate::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut $crate::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

pub(crate) use impl_resource;
