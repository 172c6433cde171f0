// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! adm.rs
//!
//! The DRBD utilities (`drbdadm`, `drbdsetup`, `drbdmeta`) as seen by the reconciler.

use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{Read, Seek, SeekFrom},
    process::Command,
    time::Duration,
};

use log::{debug, trace, warn};

use crate::exec::{self, ExecutionError};

pub const DRBDADM: &str = "drbdadm";
pub const DRBDSETUP: &str = "drbdsetup";
pub const DRBDMETA: &str = "drbdmeta";

/// drbdmeta exit codes that mean "there is no usable metadata".
const DRBDMETA_NO_VALID_MD_RC: i32 = 255;
const DRBDMETA_STRANGE_BM_OFFSET: i32 = 1;

const PRIMARY_RETRIES: u32 = 3;
const PRIMARY_RETRY_DELAY: Duration = Duration::from_millis(500);
const CONCURRENT_STATE_CHANGE: &str = "Concurrent state changes detected and aborted";

/// Seconds to wait for the peers to connect before resizing.
const WAIT_CONNECT_RES_TIME: u32 = 10;

const MD_SUPERBLOCK_SIZE: u64 = 4096;
const MD_MAGIC_OFFSET: usize = 60;
const DRBD_MD_MAGIC_08: u32 = 0x8374_026b;
const DRBD_MD_MAGIC_84_UNCLEAN: u32 = 0x8374_026c;
const DRBD_MD_MAGIC_09: u32 = 0x8374_026d;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdFlavor {
    Internal,
    FlexExternal,
}

impl MdFlavor {
    pub fn for_external(external: bool) -> Self {
        if external {
            MdFlavor::FlexExternal
        } else {
            MdFlavor::Internal
        }
    }
}

impl fmt::Display for MdFlavor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            MdFlavor::Internal => "internal",
            MdFlavor::FlexExternal => "flex-external",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdjustOptions {
    pub discard_my_data: bool,
    pub skip_net: bool,
    pub skip_disk: bool,
}

/// Activity log geometry written by `create-md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityLog {
    pub stripes: u32,
    pub stripe_size_kib: u64,
}

impl ActivityLog {
    pub const DEFAULT: ActivityLog = ActivityLog {
        stripes: 1,
        stripe_size_kib: 32,
    };

    pub fn is_default(&self) -> bool {
        *self == Self::DEFAULT
    }
}

fn create_md_args(rsc: &str, vlm_nr: u32, peer_slots: u16, al: ActivityLog) -> Vec<String> {
    let mut args = vec![
        "-vvv".to_string(),
        "--max-peers".to_string(),
        peer_slots.to_string(),
        "--".to_string(),
        "--force".to_string(),
    ];
    // drbdadm hands everything after "--" to drbdmeta
    if !al.is_default() {
        args.push(format!("--al-stripes={}", al.stripes));
        args.push(format!("--al-stripe-size-kB={}", al.stripe_size_kib));
    }
    args.push("create-md".to_string());
    args.push(format!("{rsc}/{vlm_nr}"));
    args
}

/// Arguments for programming a generation identifier into freshly created metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetGi {
    pub node_id: u32,
    pub minor: u32,
    pub md_path: String,
    pub current_gi: String,
    pub history: Option<String>,
    /// Also mark the data as up to date.
    pub up_to_date: bool,
    pub internal: bool,
}

impl SetGi {
    /// The `set-gi` argument: `<current>:` followed by the bitmap, history and flag fields as
    /// far as they are needed.
    pub fn gi_data(&self) -> String {
        let mut gi = format!("{}:", self.current_gi);
        if self.up_to_date || self.history.is_some() {
            gi.push_str(&format!("0:{}:0:", self.history.as_deref().unwrap_or("0")));
            if self.up_to_date {
                gi.push_str("1:1:");
            }
        }
        gi
    }
}

/// Every DRBD operation the reconciler depends on. Each call either succeeds or returns the
/// failure of the external tool, including its diagnostic output.
pub trait DrbdAdm: Send + Sync {
    fn down(&self, rsc: &str) -> Result<(), ExecutionError>;

    fn adjust(&self, rsc: &str, opts: AdjustOptions) -> Result<(), ExecutionError>;

    /// Resize one volume. `size_kib` is only given when shrinking.
    fn resize(
        &self,
        rsc: &str,
        vlm_nr: u32,
        assume_clean: bool,
        size_kib: Option<u64>,
    ) -> Result<(), ExecutionError>;

    fn detach(&self, minor: u32, diskless: bool) -> Result<(), ExecutionError>;

    fn create_md(
        &self,
        rsc: &str,
        vlm_nr: u32,
        peer_slots: u16,
        al: ActivityLog,
    ) -> Result<(), ExecutionError>;

    fn set_gi(&self, args: &SetGi) -> Result<(), ExecutionError>;

    fn delete_peer(&self, rsc: &str, node_id: u32) -> Result<(), ExecutionError>;

    fn forget_peer(&self, rsc: &str, node_id: u32) -> Result<(), ExecutionError>;

    /// Whether drbdmeta can read the metadata on `md_path`.
    fn has_metadata(
        &self,
        md_path: &str,
        minor: u32,
        flavor: MdFlavor,
    ) -> Result<bool, ExecutionError>;

    /// Colon separated generation identifiers, current one first.
    fn current_gid(
        &self,
        md_path: &str,
        minor: u32,
        flavor: MdFlavor,
    ) -> Result<String, ExecutionError>;

    /// Raw `drbdsetup status` of all resources.
    fn status(&self) -> Result<String, ExecutionError>;

    fn status_resource_up(&self, rsc: &str) -> Result<bool, ExecutionError>;

    /// Names of resources `drbdadm adjust` would touch. Minor numbers in the dry-run output are
    /// mapped back to resource names through `minors`.
    fn list_adjustable(&self, minors: &BTreeMap<u32, String>)
        -> Result<Vec<String>, ExecutionError>;

    fn primary(&self, rsc: &str, force: bool) -> Result<(), ExecutionError>;

    fn secondary(&self, rsc: &str) -> Result<(), ExecutionError>;

    fn suspend_io(&self, rsc: &str) -> Result<(), ExecutionError>;

    fn resume_io(&self, rsc: &str) -> Result<(), ExecutionError>;

    /// Current size of `/dev/drbd<minor>` in 512 byte sectors.
    fn size_in_sectors(&self, minor: u32) -> Result<u64, ExecutionError>;

    /// Whether the DRBD super-block signature is present. Reads the device directly.
    fn has_md_signature(&self, md_path: &str, external: bool) -> std::io::Result<bool> {
        read_md_signature(md_path, external)
    }

    fn make_filesystem(&self, device: &str, fs_type: &str) -> Result<(), ExecutionError>;

    fn open_firewall_port(&self, port: u16) -> Result<(), ExecutionError>;

    fn close_firewall_port(&self, port: u16) -> Result<(), ExecutionError>;
}

/// Read the 4 KiB super-block and look for one of the known DRBD metadata magic values.
///
/// External metadata starts at offset 0, internal metadata occupies the last 4 KiB aligned
/// block of the device.
pub fn read_md_signature(md_path: &str, external: bool) -> std::io::Result<bool> {
    let mut dev = File::open(md_path)?;
    let offset = if external {
        0
    } else {
        let size = dev.seek(SeekFrom::End(0))?;
        let aligned = size & !(MD_SUPERBLOCK_SIZE - 1);
        if aligned < MD_SUPERBLOCK_SIZE {
            return Ok(false);
        }
        aligned - MD_SUPERBLOCK_SIZE
    };
    dev.seek(SeekFrom::Start(offset))?;

    let mut block = [0u8; MD_SUPERBLOCK_SIZE as usize];
    match dev.read_exact(&mut block) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e),
    }
    Ok(has_md_magic(&block))
}

pub fn has_md_magic(block: &[u8]) -> bool {
    let Some(bytes) = block.get(MD_MAGIC_OFFSET..MD_MAGIC_OFFSET + 4) else {
        return false;
    };
    let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    matches!(
        magic,
        DRBD_MD_MAGIC_08 | DRBD_MD_MAGIC_84_UNCLEAN | DRBD_MD_MAGIC_09
    )
}

/// A resource that was made primary and returns to secondary when this goes out of scope.
///
/// Use [`PrimaryGuard::release`] to observe the result of the demotion; dropping the guard
/// demotes as well but can only log a failure.
pub struct PrimaryGuard<'a> {
    adm: &'a dyn DrbdAdm,
    rsc: String,
    released: bool,
}

impl<'a> PrimaryGuard<'a> {
    pub fn acquire(adm: &'a dyn DrbdAdm, rsc: &str, force: bool) -> Result<Self, ExecutionError> {
        adm.primary(rsc, force)?;
        Ok(Self {
            adm,
            rsc: rsc.to_string(),
            released: false,
        })
    }

    pub fn release(mut self) -> Result<(), ExecutionError> {
        self.released = true;
        self.adm.secondary(&self.rsc)
    }
}

impl Drop for PrimaryGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.adm.secondary(&self.rsc) {
                warn!("failed to make resource '{}' secondary again: {e}", self.rsc);
            }
        }
    }
}

/// Production implementation calling the installed DRBD utilities.
#[derive(Debug, Default)]
pub struct DrbdUtils {
    /// Windows hosts need explicit firewall rules for the DRBD ports.
    pub windows: bool,
}

impl DrbdUtils {
    pub fn new() -> Self {
        Self {
            windows: cfg!(windows),
        }
    }

    fn wait_connect_resource(&self, rsc: &str, timeout: u32) -> Result<(), ExecutionError> {
        exec::execute_args(
            DRBDSETUP,
            [
                "wait-connect-resource",
                "--wait-after-sb=yes",
                &format!("--wfc-timeout={timeout}"),
                rsc,
            ],
        )
        .map(|_| ())
    }

    fn get_gi_command(md_path: &str, minor: u32, flavor: MdFlavor) -> Command {
        let mut cmd = Command::new(DRBDMETA);
        cmd.args([&minor.to_string(), "v09", md_path, &flavor.to_string()])
            // --force: drbdmeta would otherwise ask before opening a device that DRBD still holds
            .args(["get-gi", "--node-id", "0", "--force"]);
        cmd
    }
}

impl DrbdAdm for DrbdUtils {
    fn down(&self, rsc: &str) -> Result<(), ExecutionError> {
        exec::execute_args(DRBDSETUP, ["down", rsc]).map(|_| ())
    }

    fn adjust(&self, rsc: &str, opts: AdjustOptions) -> Result<(), ExecutionError> {
        let mut cmd = Command::new(DRBDADM);
        cmd.args(["-vvv", "adjust"]);
        if opts.discard_my_data {
            cmd.arg("--discard-my-data");
        }
        if opts.skip_net {
            cmd.arg("--skip-net");
        }
        if opts.skip_disk {
            cmd.arg("--skip-disk");
        }
        cmd.arg(rsc);
        exec::execute(&mut cmd).map(|_| ())
    }

    fn resize(
        &self,
        rsc: &str,
        vlm_nr: u32,
        assume_clean: bool,
        size_kib: Option<u64>,
    ) -> Result<(), ExecutionError> {
        self.wait_connect_resource(rsc, WAIT_CONNECT_RES_TIME)?;

        let mut cmd = Command::new(DRBDADM);
        cmd.arg("-vvv");
        if assume_clean {
            cmd.args(["--", "--assume-clean"]);
        }
        if let Some(size) = size_kib {
            cmd.arg(format!("--size={size}K"));
        }
        cmd.arg("resize").arg(format!("{rsc}/{vlm_nr}"));
        exec::execute(&mut cmd).map(|_| ())
    }

    fn detach(&self, minor: u32, diskless: bool) -> Result<(), ExecutionError> {
        let mut cmd = Command::new(DRBDSETUP);
        cmd.args(["detach", &minor.to_string()]);
        if diskless {
            cmd.arg("--diskless");
        }
        exec::execute(&mut cmd).map(|_| ())
    }

    fn create_md(
        &self,
        rsc: &str,
        vlm_nr: u32,
        peer_slots: u16,
        al: ActivityLog,
    ) -> Result<(), ExecutionError> {
        exec::execute_args(DRBDADM, create_md_args(rsc, vlm_nr, peer_slots, al)).map(|_| ())
    }

    fn set_gi(&self, args: &SetGi) -> Result<(), ExecutionError> {
        exec::execute_args(
            DRBDMETA,
            [
                "--force",
                "--node-id",
                &args.node_id.to_string(),
                &args.minor.to_string(),
                "v09",
                &args.md_path,
                &MdFlavor::for_external(!args.internal).to_string(),
                "set-gi",
                &args.gi_data(),
            ],
        )
        .map(|_| ())
    }

    fn delete_peer(&self, rsc: &str, node_id: u32) -> Result<(), ExecutionError> {
        exec::execute_args(DRBDSETUP, ["del-peer", rsc, &node_id.to_string()]).map(|_| ())
    }

    fn forget_peer(&self, rsc: &str, node_id: u32) -> Result<(), ExecutionError> {
        exec::execute_args(DRBDSETUP, ["forget-peer", rsc, &node_id.to_string()]).map(|_| ())
    }

    fn has_metadata(
        &self,
        md_path: &str,
        minor: u32,
        flavor: MdFlavor,
    ) -> Result<bool, ExecutionError> {
        // Anything but the two well known "no metadata" codes counts as metadata present. Failing
        // because metadata was not detected is better than overwriting it.
        let output = exec::run(&mut Self::get_gi_command(md_path, minor, flavor))?;
        Ok(!matches!(
            output.status.code(),
            Some(DRBDMETA_NO_VALID_MD_RC) | Some(DRBDMETA_STRANGE_BM_OFFSET)
        ))
    }

    fn current_gid(
        &self,
        md_path: &str,
        minor: u32,
        flavor: MdFlavor,
    ) -> Result<String, ExecutionError> {
        let output = exec::run(&mut Self::get_gi_command(md_path, minor, flavor))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn status(&self) -> Result<String, ExecutionError> {
        let output = exec::execute_args(DRBDSETUP, ["status"])?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn status_resource_up(&self, rsc: &str) -> Result<bool, ExecutionError> {
        let output = exec::run(Command::new(DRBDSETUP).args(["status", rsc]))?;
        Ok(output.status.success())
    }

    fn list_adjustable(
        &self,
        minors: &BTreeMap<u32, String>,
    ) -> Result<Vec<String>, ExecutionError> {
        let output = exec::execute_args(DRBDADM, ["-d", "adjust", "all"])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_adjustable(&stdout, minors))
    }

    fn primary(&self, rsc: &str, force: bool) -> Result<(), ExecutionError> {
        let mut cmd = Command::new(DRBDADM);
        cmd.args(["-vvv", "primary"]);
        if force {
            cmd.arg("--force");
        }
        cmd.arg(rsc);

        let mut retries = PRIMARY_RETRIES;
        loop {
            let output = exec::run(&mut cmd)?;
            if output.status.success() {
                return Ok(());
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            if retries > 0 && stderr.contains(CONCURRENT_STATE_CHANGE) {
                retries -= 1;
                debug!("primary on '{rsc}' hit a concurrent state change, retrying");
                std::thread::sleep(PRIMARY_RETRY_DELAY);
                continue;
            }
            return Err(exec::output_to_exec_error(&cmd, &output));
        }
    }

    fn secondary(&self, rsc: &str) -> Result<(), ExecutionError> {
        exec::execute_args(DRBDADM, ["secondary", rsc]).map(|_| ())
    }

    fn suspend_io(&self, rsc: &str) -> Result<(), ExecutionError> {
        exec::execute_args(DRBDADM, ["suspend-io", rsc]).map(|_| ())
    }

    fn resume_io(&self, rsc: &str) -> Result<(), ExecutionError> {
        exec::execute_args(DRBDADM, ["resume-io", rsc]).map(|_| ())
    }

    fn size_in_sectors(&self, minor: u32) -> Result<u64, ExecutionError> {
        let path = format!("/sys/block/drbd{minor}/size");
        let content =
            std::fs::read_to_string(&path).map_err(|err| ExecutionError::ExecutionStart {
                command: format!("read {path}"),
                err,
            })?;
        content
            .trim()
            .parse()
            .map_err(|e| ExecutionError::ParseFailure {
                command: format!("read {path}"),
                reason: format!("'{}': {e}", content.trim()),
            })
    }

    fn make_filesystem(&self, device: &str, fs_type: &str) -> Result<(), ExecutionError> {
        trace!("creating {fs_type} filesystem on {device}");
        exec::execute_args(&format!("mkfs.{fs_type}"), ["-q", device]).map(|_| ())
    }

    fn open_firewall_port(&self, port: u16) -> Result<(), ExecutionError> {
        if !self.windows {
            return Ok(());
        }
        exec::execute_args(
            "netsh",
            [
                "advfirewall",
                "firewall",
                "add",
                "rule",
                &format!("name=DRBD-{port}"),
                "dir=in",
                "action=allow",
                "protocol=TCP",
                &format!("localport={port}"),
            ],
        )
        .map(|_| ())
    }

    fn close_firewall_port(&self, port: u16) -> Result<(), ExecutionError> {
        if !self.windows {
            return Ok(());
        }
        exec::execute_args(
            "netsh",
            [
                "advfirewall",
                "firewall",
                "delete",
                "rule",
                &format!("name=DRBD-{port}"),
            ],
        )
        .map(|_| ())
    }
}

/// Extract the affected resources from the commands `drbdadm -d adjust all` would run.
///
/// Lines look like `drbdsetup <verb> <object> ...` or `drbdmeta <minor> v09 ...`, where the
/// object is either `<resource>`, `<resource>/<volume>` or a minor number.
pub fn parse_adjustable(output: &str, minors: &BTreeMap<u32, String>) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        let object = match tokens.next() {
            Some(DRBDSETUP) => tokens.nth(1),
            Some(DRBDMETA) => tokens.next(),
            _ => None,
        };
        let Some(object) = object else {
            continue;
        };
        let name = match object.parse::<u32>() {
            Ok(minor) => match minors.get(&minor) {
                Some(name) => name.clone(),
                None => continue,
            },
            Err(_) => object.split('/').next().unwrap_or(object).to_string(),
        };
        let name = name.to_lowercase();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gi_data_variants() {
        let mut args = SetGi {
            node_id: 1,
            minor: 1000,
            md_path: "/dev/vg/r0_00000".to_string(),
            current_gi: "ABCDEF0123456789".to_string(),
            history: None,
            up_to_date: false,
            internal: true,
        };
        assert_eq!(args.gi_data(), "ABCDEF0123456789:");
        args.up_to_date = true;
        assert_eq!(args.gi_data(), "ABCDEF0123456789:0:0:0:1:1:");
        args.up_to_date = false;
        args.history = Some("1234".to_string());
        assert_eq!(args.gi_data(), "ABCDEF0123456789:0:1234:0:");
    }

    #[test]
    fn activity_log_options_only_when_not_default() {
        let args = create_md_args("r0", 1, 7, ActivityLog::DEFAULT);
        assert_eq!(args.join(" "), "-vvv --max-peers 7 -- --force create-md r0/1");

        let al = ActivityLog {
            stripes: 4,
            stripe_size_kib: 64,
        };
        assert_eq!(
            create_md_args("r0", 1, 7, al).join(" "),
            "-vvv --max-peers 7 -- --force --al-stripes=4 --al-stripe-size-kB=64 create-md r0/1"
        );
    }

    #[test]
    fn md_magic_detection() {
        let mut block = vec![0u8; 4096];
        assert!(!has_md_magic(&block));
        block[60..64].copy_from_slice(&DRBD_MD_MAGIC_09.to_be_bytes());
        assert!(has_md_magic(&block));
        assert!(!has_md_magic(&block[..62]));
    }

    #[test]
    fn adjustable_names() {
        let output = "\
drbdsetup new-resource Alpha 1 --auto-promote=no
drbdsetup attach 1001 /dev/vg/beta_00000 /dev/vg/beta_00000 internal
drbdsetup resize alpha/0
drbdmeta 1002 v09 /dev/vg/gamma_00000 internal apply-al
some unrelated line
";
        let minors = BTreeMap::from([(1001, "beta".to_string())]);
        assert_eq!(
            parse_adjustable(output, &minors),
            vec!["alpha".to_string(), "beta".to_string()]
        );
    }

    #[test]
    fn internal_signature_is_read_from_the_end() {
        let dir = std::env::temp_dir().join(format!("replicad-md-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dev");
        let mut data = vec![0u8; 3 * 4096 + 100];
        let sb = 2 * 4096;
        data[sb + 60..sb + 64].copy_from_slice(&DRBD_MD_MAGIC_09.to_be_bytes());
        std::fs::write(&path, &data).unwrap();

        let path = path.to_str().unwrap();
        assert!(read_md_signature(path, false).unwrap());
        assert!(!read_md_signature(path, true).unwrap());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
