//! Host identity: machine id, boot id and hostname.

use crate::id128;
use std::io;
use uuid::Uuid;

/// Reads a file from the host filesystem, falling back to a `/host/` prefix
/// when running inside a container with the host root mounted there.
fn read_host_file(filename: &str) -> io::Result<String> {
    match std::fs::read_to_string(filename) {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let filename = format!("/host/{}", filename);
            std::fs::read_to_string(filename)
        }
        Err(e) => Err(e),
    }
}

fn parse_id(content: &str) -> io::Result<Uuid> {
    id128::parse(content.trim()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Loads the machine id from `/etc/machine-id`.
pub fn load_machine_id() -> io::Result<Uuid> {
    parse_id(&read_host_file("/etc/machine-id")?)
}

/// Loads the id of the current boot from the kernel.
#[cfg(target_os = "linux")]
pub fn load_boot_id() -> io::Result<Uuid> {
    parse_id(&std::fs::read_to_string("/proc/sys/kernel/random/boot_id")?)
}

#[cfg(not(target_os = "linux"))]
pub fn load_boot_id() -> io::Result<Uuid> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "boot id loading not supported on this platform",
    ))
}

pub fn hostname() -> io::Result<String> {
    let name = nix::unistd::gethostname().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    name.into_string()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "hostname is not valid UTF-8"))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn boot_id_is_stable_within_a_boot() {
        let a = load_boot_id().unwrap();
        let b = load_boot_id().unwrap();
        assert_eq!(a, b);
        assert!(!id128::is_null(&a));
    }

    #[test]
    fn parse_id_trims_whitespace() {
        let id = parse_id("0123456789abcdef0123456789abcdef\n").unwrap();
        assert_eq!(id128::to_hex(&id), "0123456789abcdef0123456789abcdef");
        assert!(parse_id("garbage").is_err());
    }
}
