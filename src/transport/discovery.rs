//! USB serial device discovery via sysfs.
//!
//! Each `class/tty/<name>` entry whose `device` link resolves under a USB
//! device carrying `idVendor`/`idProduct` files is a candidate. The
//! matching node is `<dev_root>/<name>`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{LinkError, Result};

/// USB vendor id the phone enumerates with.
pub const DEFAULT_VENDOR_ID: u16 = 0x3310;

/// USB product id of the phone's desktop interface.
pub const DEFAULT_PRODUCT_ID: u16 = 0x0100;

/// Directory levels searched above the tty's `device` link for USB ids.
const MAX_ANCESTOR_DEPTH: usize = 4;

/// Which device to look for, and where.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Root of the sysfs mount, `/sys` on a live system.
    pub sysfs_root: PathBuf,
    /// Directory holding device nodes, `/dev` on a live system.
    pub dev_root: PathBuf,
}

impl DeviceFilter {
    /// Filter for a specific vendor/product pair on the live system.
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            ..Self::default()
        }
    }

    /// Scan a different sysfs tree.
    pub fn sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    /// Resolve device nodes under a different directory.
    pub fn dev_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.dev_root = root.into();
        self
    }
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

/// Find the first tty (by name order) matching `filter`.
///
/// # Errors
///
/// - `MalformedDevice` if no candidate matched and at least one exposed
///   unreadable or non-hex ids
/// - `NotFound` otherwise when nothing matched
pub fn find_device(filter: &DeviceFilter) -> Result<PathBuf> {
    let tty_class = filter.sysfs_root.join("class").join("tty");
    let entries = fs::read_dir(&tty_class)
        .map_err(|e| LinkError::NotFound(format!("{}: {}", tty_class.display(), e)))?;

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();

    let mut malformed = None;
    for name in names {
        let device_link = tty_class.join(&name).join("device");
        let Some(usb_dir) = usb_ancestor(&device_link, &filter.sysfs_root) else {
            continue;
        };

        match read_ids(&usb_dir) {
            Ok((vendor, product)) => {
                tracing::debug!(
                    tty = %name,
                    vendor = format_args!("{vendor:04x}"),
                    product = format_args!("{product:04x}"),
                    "usb tty candidate"
                );
                if vendor == filter.vendor_id && product == filter.product_id {
                    return Ok(filter.dev_root.join(&name));
                }
            }
            Err(reason) => {
                tracing::warn!(tty = %name, %reason, "skipping malformed usb tty");
                malformed.get_or_insert(LinkError::MalformedDevice {
                    path: usb_dir.display().to_string(),
                    reason,
                });
            }
        }
    }

    Err(malformed.unwrap_or_else(|| {
        LinkError::NotFound(format!(
            "no tty with USB id {:04x}:{:04x}",
            filter.vendor_id, filter.product_id
        ))
    }))
}

/// Nearest directory at or above the resolved `device` link that has an
/// `idVendor` file. Virtual ttys have no `device` link and yield `None`.
fn usb_ancestor(device_link: &Path, sysfs_root: &Path) -> Option<PathBuf> {
    let mut dir = fs::canonicalize(device_link).ok()?;
    let root = fs::canonicalize(sysfs_root).ok()?;

    for _ in 0..MAX_ANCESTOR_DEPTH {
        if dir.join("idVendor").exists() {
            return Some(dir);
        }
        if dir == root || !dir.pop() {
            break;
        }
    }
    None
}

fn read_ids(usb_dir: &Path) -> std::result::Result<(u16, u16), String> {
    Ok((
        read_hex_id(&usb_dir.join("idVendor"))?,
        read_hex_id(&usb_dir.join("idProduct"))?,
    ))
}

fn read_hex_id(path: &Path) -> std::result::Result<u16, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    u16::from_str_radix(text.trim(), 16)
        .map_err(|_| format!("{}: {:?} is not a 16-bit hex id", path.display(), text.trim()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    /// Lay out `devices/<usb>/<usb>:1.0` plus `class/tty/<tty>/device -> ...`.
    fn add_tty(root: &Path, tty: &str, usb: &str, vendor: &str, product: Option<&str>) {
        let usb_dir = root.join("devices").join(usb);
        let iface = usb_dir.join(format!("{usb}:1.0"));
        fs::create_dir_all(&iface).unwrap();
        fs::write(usb_dir.join("idVendor"), format!("{vendor}\n")).unwrap();
        if let Some(product) = product {
            fs::write(usb_dir.join("idProduct"), format!("{product}\n")).unwrap();
        }

        let class_entry = root.join("class").join("tty").join(tty);
        fs::create_dir_all(&class_entry).unwrap();
        symlink(&iface, class_entry.join("device")).unwrap();
    }

    fn add_virtual_tty(root: &Path, tty: &str) {
        fs::create_dir_all(root.join("class").join("tty").join(tty)).unwrap();
    }

    fn filter(root: &TempDir) -> DeviceFilter {
        DeviceFilter::default()
            .sysfs_root(root.path())
            .dev_root("/dev")
    }

    #[test]
    fn test_finds_matching_device() {
        let root = TempDir::new().unwrap();
        add_virtual_tty(root.path(), "tty0");
        add_tty(root.path(), "ttyACM0", "1-1", "1d6b", Some("0002"));
        add_tty(root.path(), "ttyACM1", "1-2", "3310", Some("0100"));

        let path = find_device(&filter(&root)).unwrap();
        assert_eq!(path, PathBuf::from("/dev/ttyACM1"));
    }

    #[test]
    fn test_no_match_is_not_found() {
        let root = TempDir::new().unwrap();
        add_virtual_tty(root.path(), "tty0");
        add_tty(root.path(), "ttyACM0", "1-1", "1d6b", Some("0002"));

        let err = find_device(&filter(&root)).unwrap_err();
        assert!(matches!(err, LinkError::NotFound(_)));
    }

    #[test]
    fn test_missing_tty_class_is_not_found() {
        let root = TempDir::new().unwrap();
        let err = find_device(&filter(&root)).unwrap_err();
        assert!(matches!(err, LinkError::NotFound(_)));
    }

    #[test]
    fn test_unparseable_ids_are_malformed() {
        let root = TempDir::new().unwrap();
        add_tty(root.path(), "ttyACM0", "1-1", "zzzz", Some("0100"));

        let err = find_device(&filter(&root)).unwrap_err();
        assert!(matches!(err, LinkError::MalformedDevice { .. }));
    }

    #[test]
    fn test_missing_product_file_is_malformed() {
        let root = TempDir::new().unwrap();
        add_tty(root.path(), "ttyACM0", "1-1", "3310", None);

        let err = find_device(&filter(&root)).unwrap_err();
        assert!(matches!(err, LinkError::MalformedDevice { .. }));
    }

    #[test]
    fn test_match_wins_over_malformed_sibling() {
        let root = TempDir::new().unwrap();
        add_tty(root.path(), "ttyACM0", "1-1", "nothex", Some("0100"));
        add_tty(root.path(), "ttyACM1", "1-2", "3310", Some("0100"));

        assert_eq!(
            find_device(&filter(&root)).unwrap(),
            PathBuf::from("/dev/ttyACM1")
        );
    }

    #[test]
    fn test_custom_ids() {
        let root = TempDir::new().unwrap();
        add_tty(root.path(), "ttyACM0", "1-1", "1209", Some("beef"));

        let filter = DeviceFilter::new(0x1209, 0xbeef)
            .sysfs_root(root.path())
            .dev_root(root.path().join("dev"));
        assert_eq!(
            find_device(&filter).unwrap(),
            root.path().join("dev").join("ttyACM0")
        );
    }
}
