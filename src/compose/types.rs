//! Per-type builder arguments
//!
//! Every image type maps to a fixed set of options consumed by the
//! downstream image builder. The field names and values here are part of the
//! on-disk `config.toml` contract; consumers depend on them bit for bit.

use serde::{Deserialize, Serialize};

/// `image_type` is either disabled (`false` in TOML) or a qemu format name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageType {
    Disabled(bool),
    Named(String),
}

impl ImageType {
    fn named(name: &str) -> Self {
        ImageType::Named(name.to_string())
    }
}

/// The options defining one output type: what to build, what to call it, and
/// how to post-process it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeArgs {
    pub make_iso: bool,
    pub make_disk: bool,
    pub make_fsimage: bool,
    pub make_appliance: bool,
    pub make_ami: bool,
    pub make_tar: bool,
    pub make_tar_disk: bool,
    pub make_pxe_live: bool,
    pub make_ostree_live: bool,
    pub make_oci: bool,
    pub make_vagrant: bool,
    pub ostree: bool,
    pub live_rootfs_keep_size: bool,
    pub live_rootfs_size: u64,
    pub image_size_align: u64,
    pub image_type: ImageType,
    pub qemu_args: Vec<String>,
    pub image_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tar_disk_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_label: Option<String>,
    pub image_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress_args: Option<Vec<String>>,
}

impl ComposeArgs {
    /// The common baseline every type starts from.
    fn base(image_name: &str) -> Self {
        Self {
            make_iso: false,
            make_disk: false,
            make_fsimage: false,
            make_appliance: false,
            make_ami: false,
            make_tar: false,
            make_tar_disk: false,
            make_pxe_live: false,
            make_ostree_live: false,
            make_oci: false,
            make_vagrant: false,
            ostree: false,
            live_rootfs_keep_size: false,
            live_rootfs_size: 0,
            image_size_align: 0,
            image_type: ImageType::Disabled(false),
            qemu_args: Vec::new(),
            image_name: image_name.to_string(),
            tar_disk_name: None,
            fs_label: None,
            image_only: true,
            app_name: None,
            app_template: None,
            app_file: None,
            iso_only: None,
            iso_name: None,
            compression: None,
            compress_args: None,
        }
    }
}

/// The builder arguments for `compose_type`, or `None` for unknown types.
pub fn compose_args(compose_type: &str) -> Option<ComposeArgs> {
    let args = match compose_type {
        "tar" => ComposeArgs {
            make_tar: true,
            ..ComposeArgs::base("root.tar.xz")
        },
        "live-iso" => ComposeArgs {
            make_iso: true,
            // Live booting may expect the label to be 'Anaconda'
            fs_label: Some("Anaconda".to_string()),
            image_only: false,
            iso_only: Some(true),
            iso_name: Some("live.iso".to_string()),
            ..ComposeArgs::base("live.iso")
        },
        "partitioned-disk" => ComposeArgs {
            make_disk: true,
            fs_label: Some(String::new()),
            ..ComposeArgs::base("disk.img")
        },
        "qcow2" => ComposeArgs {
            make_disk: true,
            image_type: ImageType::named("qcow2"),
            fs_label: Some(String::new()),
            ..ComposeArgs::base("disk.qcow2")
        },
        "ext4-filesystem" => ComposeArgs {
            make_fsimage: true,
            fs_label: Some(String::new()),
            ..ComposeArgs::base("filesystem.img")
        },
        "ami" => ComposeArgs {
            make_disk: true,
            fs_label: Some(String::new()),
            ..ComposeArgs::base("disk.ami")
        },
        "vhd" => ComposeArgs {
            make_disk: true,
            image_type: ImageType::named("vpc"),
            qemu_args: vec!["-o".to_string(), "subformat=fixed,force_size".to_string()],
            fs_label: Some(String::new()),
            ..ComposeArgs::base("disk.vhd")
        },
        "vmdk" => ComposeArgs {
            make_disk: true,
            image_type: ImageType::named("vmdk"),
            fs_label: Some(String::new()),
            ..ComposeArgs::base("disk.vmdk")
        },
        "openstack" => ComposeArgs {
            make_disk: true,
            image_type: ImageType::named("qcow2"),
            fs_label: Some(String::new()),
            ..ComposeArgs::base("disk.qcow2")
        },
        "google" => ComposeArgs {
            make_disk: true,
            make_tar_disk: true,
            image_size_align: 1024,
            tar_disk_name: Some("disk.raw".to_string()),
            compression: Some("gzip".to_string()),
            compress_args: Some(vec!["-9".to_string()]),
            fs_label: Some(String::new()),
            ..ComposeArgs::base("disk.tar.gz")
        },
        "alibaba" => ComposeArgs {
            make_disk: true,
            image_type: ImageType::named("qcow2"),
            fs_label: Some(String::new()),
            ..ComposeArgs::base("disk.qcow2")
        },
        _ => return None,
    };
    Some(args)
}

/// The full `config.toml` handed to the downstream builder: the per-type
/// arguments plus host identity, boot arguments, and run parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    #[serde(flatten)]
    pub compose: ComposeArgs,
    pub title: String,
    pub project: String,
    pub releasever: String,
    pub volid: String,
    pub extra_boot_args: String,
    pub ks: Vec<String>,
    pub logfile: String,
    /// Build timeout in minutes.
    pub timeout: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unknown_type_has_no_args() {
        assert!(compose_args("hyper-v").is_none());
        assert!(compose_args("").is_none());
    }

    #[test]
    fn tar_type_makes_a_tar_only() {
        let args = compose_args("tar").unwrap();
        assert!(args.make_tar);
        assert!(!args.make_disk && !args.make_iso && !args.make_fsimage);
        assert_eq!(args.image_name, "root.tar.xz");
        assert_eq!(args.image_type, ImageType::Disabled(false));
        assert!(args.fs_label.is_none());
    }

    #[test]
    fn app_fields_exist_and_are_unset_for_every_type() {
        for t in [
            "tar",
            "live-iso",
            "partitioned-disk",
            "qcow2",
            "ext4-filesystem",
            "ami",
            "vhd",
            "vmdk",
            "openstack",
            "google",
            "alibaba",
        ] {
            let args = compose_args(t).unwrap();
            assert!(args.app_name.is_none(), "{t}");
            assert!(args.app_template.is_none(), "{t}");
            assert!(args.app_file.is_none(), "{t}");
        }
    }

    #[test]
    fn vhd_uses_fixed_subformat() {
        let args = compose_args("vhd").unwrap();
        assert_eq!(args.image_type, ImageType::named("vpc"));
        assert_eq!(args.qemu_args, vec!["-o", "subformat=fixed,force_size"]);
    }

    #[test]
    fn google_tars_the_disk() {
        let args = compose_args("google").unwrap();
        assert!(args.make_disk && args.make_tar_disk);
        assert_eq!(args.image_size_align, 1024);
        assert_eq!(args.tar_disk_name.as_deref(), Some("disk.raw"));
        assert_eq!(args.compression.as_deref(), Some("gzip"));
        assert_eq!(args.compress_args.as_deref(), Some(&["-9".to_string()][..]));
        assert_eq!(args.image_name, "disk.tar.gz");
    }

    #[test]
    fn live_iso_renames_boot_iso() {
        let args = compose_args("live-iso").unwrap();
        assert!(args.make_iso);
        assert_eq!(args.fs_label.as_deref(), Some("Anaconda"));
        assert_eq!(args.iso_name.as_deref(), Some("live.iso"));
        assert_eq!(args.iso_only, Some(true));
        assert!(!args.image_only);
    }

    #[test]
    fn openstack_and_alibaba_are_qcow2_like() {
        for t in ["openstack", "alibaba"] {
            let args = compose_args(t).unwrap();
            assert!(args.make_disk);
            assert_eq!(args.image_type, ImageType::named("qcow2"));
            assert_eq!(args.image_name, "disk.qcow2");
        }
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = BuilderConfig {
            compose: ComposeArgs {
                compression: Some("xz".to_string()),
                compress_args: Some(Vec::new()),
                ..compose_args("qcow2").unwrap()
            },
            title: "Fedora 28".to_string(),
            project: "Fedora".to_string(),
            releasever: "28".to_string(),
            volid: String::new(),
            extra_boot_args: "nosmt=force".to_string(),
            ks: vec!["/var/lib/imageforge/results/x/final-kickstart.ks".to_string()],
            logfile: "/var/lib/imageforge/results/x/logs/".to_string(),
            timeout: 60,
        };
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("image_type = \"qcow2\""));
        assert!(text.contains("extra_boot_args = \"nosmt=force\""));
        let back: BuilderConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.compose, config.compose);
        assert_eq!(back.timeout, 60);
    }

    #[test]
    fn disabled_image_type_serializes_as_false() {
        let text = toml::to_string(&compose_args("tar").unwrap()).unwrap();
        assert!(text.contains("image_type = false"));
    }
}
