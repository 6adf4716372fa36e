//! Interactive agent identity attached to a live connection.

use c2mux_core::messages::RegisterPayload;
use serde::Serialize;

/// A registered interactive agent. `id` is the owning connection's ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: u64,
    pub name: String,
    pub hostname: String,
    pub username: String,
    pub uid: String,
    pub gid: String,
    pub os: String,
    pub arch: String,
    pub transport: String,
    pub remote_address: String,
    pub pid: i32,
    pub filename: String,
}

impl Session {
    /// Build a session from a registration payload.
    ///
    /// When the agent does not report its own remote address, the
    /// transport-observed address is used instead.
    pub fn from_registration(id: u64, reg: &RegisterPayload, observed_addr: Option<&str>) -> Self {
        let remote_address = if reg.remote_address.is_empty() {
            observed_addr.unwrap_or_default().to_string()
        } else {
            reg.remote_address.clone()
        };
        Self {
            id,
            name: reg.name.clone(),
            hostname: reg.hostname.clone(),
            username: reg.username.clone(),
            uid: reg.uid.clone(),
            gid: reg.gid.clone(),
            os: reg.os.clone(),
            arch: reg.arch.clone(),
            transport: reg.transport.clone(),
            remote_address,
            pid: reg.pid,
            filename: reg.filename.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observed_address_fills_the_gap() {
        let reg = RegisterPayload {
            name: "QUIET_HERON".into(),
            ..Default::default()
        };
        let s = Session::from_registration(4, &reg, Some("10.0.0.9:51234"));
        assert_eq!(s.id, 4);
        assert_eq!(s.remote_address, "10.0.0.9:51234");

        let reg = RegisterPayload {
            remote_address: "192.168.1.2:443".into(),
            ..reg
        };
        let s = Session::from_registration(4, &reg, Some("10.0.0.9:51234"));
        assert_eq!(s.remote_address, "192.168.1.2:443");
    }
}
