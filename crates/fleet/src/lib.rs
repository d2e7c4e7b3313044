#![doc = r#"
fleet: the top-level manager tying the host registry to live
[`fleet_client::RemoteHost`] connections.

One lock serializes every session-mutating operation (connect,
resume-or-deploy, disconnect) so two concurrent first-connects for the
same host name can't race to deploy two sessions.
"#]

pub mod manager;

pub use manager::FleetManager;
