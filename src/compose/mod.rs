//! Build composer
//!
//! Turns a committed blueprint plus an image type into a queued build:
//! depsolve the merged package set, generate the final kickstart with
//! customizations spliced in, persist the reproducibility artifacts, and
//! atomically hand the build to the queue.
//!
//! Adding a new output type means shipping a kickstart template at
//! `<share_dir>/composer/<type>.ks` (its `%packages` section left
//! unterminated; the composer appends the resolved NEVRAs and the closing
//! `%end`) and an entry in [`types::compose_args`].

pub mod gitrpm;
pub mod template;
pub mod types;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::blueprint::Blueprint;
use crate::config::Config;
use crate::customize::{customize_template, post_customizations, CustomizeError};
use crate::queue::{self, BuildStatus};
use crate::resolver::{PackageNEVRA, ResolverError, ResolverHandle, Source, SourceType};
use crate::store::{BlueprintStore, StoreError};

pub use types::{compose_args, BuilderConfig, ComposeArgs, ImageType};

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("Invalid compose type ({0}), must be one of {1:?}")]
    BadType(String, Vec<String>),

    #[error("Compose type '{0}' is disabled on this architecture")]
    DisabledType(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Problem depsolving {0}: {1}")]
    Depsolve(String, ResolverError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    Customize(#[from] CustomizeError),

    #[error("{0}")]
    BuildFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Blueprint(#[from] crate::blueprint::BlueprintError),
}

/// Compose types that are not supported on an architecture. Types not
/// listed are allowed.
fn arch_disabled_types(arch: &str) -> &'static [&'static str] {
    const COMMON: &[&str] = &["alibaba", "ami", "google", "hyper-v", "vhd", "vmdk"];
    // aarch64 supports ami, the other non-x86 arches do not.
    const AARCH64: &[&str] = &["alibaba", "google", "hyper-v", "vhd", "vmdk"];
    match arch {
        "arm" | "armhfp" => COMMON,
        "aarch64" => AARCH64,
        "ppc" | "ppc64" | "ppc64le" | "s390" | "s390x" => COMMON,
        _ => &[],
    }
}

/// The supported output types and whether each is enabled on `arch`.
///
/// The types come from the kickstart templates in `<share_dir>/composer/`;
/// each `<type>.ks` defines one.
pub fn compose_types(share_dir: &Path, arch: &str) -> Vec<(String, bool)> {
    let composer_dir = share_dir.join("composer");
    let mut all_types: Vec<String> = fs::read_dir(&composer_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    e.file_name()
                        .to_str()
                        .and_then(|n| n.strip_suffix(".ks"))
                        .map(|n| n.to_string())
                })
                .collect()
        })
        .unwrap_or_default();
    all_types.sort();

    let disabled = arch_disabled_types(arch);
    all_types
        .into_iter()
        .map(|t| {
            let enabled = !disabled.contains(&t.as_str());
            (t, enabled)
        })
        .collect()
}

/// The machine architecture, as reported by `uname(2)`.
pub fn build_arch() -> String {
    let mut name: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut name) } == 0 {
        let machine = unsafe { std::ffi::CStr::from_ptr(name.machine.as_ptr()) };
        machine.to_string_lossy().into_owned()
    } else {
        std::env::consts::ARCH.to_string()
    }
}

/// Render a source as kickstart `url`/`repo` command arguments. `url_arg`
/// is `"url"` for the installation url and `"baseurl"` for extra repos.
pub fn repo_to_ks(source: &Source, url_arg: &str) -> String {
    let mut args = Vec::new();
    match source.source_type {
        SourceType::YumBaseurl => args.push(format!("--{url_arg}=\"{}\"", source.url)),
        SourceType::YumMetalink => args.push(format!("--metalink=\"{}\"", source.url)),
        SourceType::YumMirrorlist => args.push(format!("--mirrorlist=\"{}\"", source.url)),
    }
    if let Some(proxy) = &source.proxy {
        args.push(format!("--proxy=\"{proxy}\""));
    }
    if !source.check_ssl {
        args.push("--noverifyssl".to_string());
    }
    if let Some(cert) = &source.sslcacert {
        args.push(format!("--sslcacert=\"{cert}\""));
    }
    if let Some(cert) = &source.sslclientcert {
        args.push(format!("--sslclientcert=\"{cert}\""));
    }
    if let Some(key) = &source.sslclientkey {
        args.push(format!("--sslclientkey=\"{key}\""));
    }
    args.join(" ")
}

/// Read the os-release style `KEY=VALUE` file used for host identity.
pub fn os_release_fields(path: &Path) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let Ok(text) = fs::read_to_string(path) else {
        tracing::error!(path = %path.display(),
            "os-release file is missing, cannot determine product or release version");
        return fields;
    };
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            fields.insert(key.trim().to_string(), value.to_string());
        }
    }
    fields
}

/// Pad the combined installed size by 20%, in integer arithmetic so the
/// result never drifts with float rounding.
pub fn padded_size(installed_size: u64, template_size: u64) -> u64 {
    let total = installed_size + template_size;
    (total * 12 + 9) / 10
}

const MIB: u64 = 1024 * 1024;

#[derive(Serialize)]
struct DepsDocument<'a> {
    packages: &'a [PackageNEVRA],
}

fn kernel_append(blueprint: &Blueprint) -> String {
    blueprint
        .customizations
        .as_ref()
        .and_then(|c| c.kernel.as_ref())
        .map(|k| k.append.clone())
        .unwrap_or_default()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Start a build of `(branch, blueprint_name)` for `compose_type`.
///
/// The blueprint is read from the committed head (never the workspace) with
/// its commit id captured, the merged package set is depsolved with a forced
/// metadata refresh, the final kickstart and builder config are written into
/// a fresh result directory, and the build is handed to the queue by
/// creating the `queue/new/<build_id>` symlink.
///
/// Returns the build id used to track status.
pub fn start_build(
    cfg: &Config,
    store: &Mutex<BlueprintStore>,
    resolver: &Mutex<ResolverHandle>,
    branch: &str,
    blueprint_name: &str,
    compose_type: &str,
    test_mode: u32,
) -> Result<Uuid, ComposeError> {
    let share_dir = &cfg.paths.share_dir;
    let lib_dir = &cfg.paths.lib_dir;
    let arch = cfg.resolver.arch.clone().unwrap_or_else(build_arch);

    // Only enabled types may build.
    let types = compose_types(share_dir, &arch);
    match types.iter().find(|(t, _)| t == compose_type) {
        None => {
            return Err(ComposeError::BadType(
                compose_type.to_string(),
                types.into_iter().map(|(t, _)| t).collect(),
            ))
        }
        Some((_, false)) => return Err(ComposeError::DisabledType(compose_type.to_string())),
        Some((_, true)) => {}
    }

    // Some image types need extra packages for the composer to execute the
    // output template.
    let extra_pkgs = if compose_type == "live-iso" {
        template::live_template_packages(share_dir)?
    } else {
        Vec::new()
    };
    debug!(compose_type, ?extra_pkgs, "extra packages for output type");

    // The build is reproducible from the captured commit; workspace edits
    // never influence it.
    let (commit_id, recipe) = {
        let store = lock(store);
        store.read_with_commit_id(branch, blueprint_name)?
    };

    let mut projects = recipe.module_nver();
    projects.extend(recipe.package_nver());
    projects.extend(extra_pkgs.into_iter().map(|name| (name, "*".to_string())));
    projects.sort_by(|a, b| {
        a.0.to_lowercase()
            .cmp(&b.0.to_lowercase())
            .then_with(|| a.1.cmp(&b.1))
    });
    projects.dedup();

    info!(blueprint = %recipe.name, "depsolving");
    let (installed_size, deps) = {
        // may-refresh acquire: re-open and resolve without releasing the
        // lock in between, so the build sees metadata as of enqueue time.
        let mut resolver = lock(resolver);
        resolver.refresh()?;
        resolver
            .depsolve(&projects, &recipe.group_names(), false)
            .map_err(|e| ComposeError::Depsolve(recipe.name.clone(), e))?
    };

    // How much space will the packages in the type's own template take?
    let ks_template_path = share_dir.join("composer").join(format!("{compose_type}.ks"));
    let ks_template = fs::read_to_string(&ks_template_path)?;
    let parsed = template::parse_packages_section(&ks_template);
    let template_projects: Vec<(String, String)> = parsed
        .packages
        .iter()
        .map(|name| (name.clone(), "*".to_string()))
        .collect();
    let (template_size, _) = {
        let mut resolver = lock(resolver);
        resolver
            .depsolve(&template_projects, &parsed.groups, !parsed.nocore)
            .map_err(|e| ComposeError::Depsolve(recipe.name.clone(), e))?
    };
    debug!(installed_size, template_size, "depsolved sizes");

    let partition_bytes = padded_size(installed_size, template_size);
    debug!(partition_bytes, "root partition size");

    // Allocate the result directory and persist the reproducibility
    // artifacts.
    let build_id = Uuid::new_v4();
    let results_dir = lib_dir.join("results").join(build_id.to_string());
    fs::create_dir_all(&results_dir)?;

    fs::write(results_dir.join("COMMIT"), &commit_id)?;
    fs::write(results_dir.join("blueprint.toml"), recipe.to_toml_string()?)?;
    fs::write(
        results_dir.join("frozen.toml"),
        recipe.freeze(&deps).to_toml_string()?,
    )?;
    fs::write(
        results_dir.join("deps.toml"),
        toml::to_string(&DepsDocument { packages: &deps })?,
    )?;
    fs::copy(
        &ks_template_path,
        results_dir.join(format!("{compose_type}.ks")),
    )?;

    let sources = {
        let mut resolver = lock(resolver);
        resolver.enabled_sources()?
    };
    if sources.is_empty() {
        return Err(ComposeError::BuildFailed(
            "No enabled repos, canceling build.".to_string(),
        ));
    }

    // Build rpms for any [[repos.git]] entries.
    let gitrpm_repo = gitrpm::create_gitrpm_repo(&results_dir, &recipe)?;

    // Assemble the final kickstart.
    let ks_path = results_dir.join("final-kickstart.ks");
    let mut ks = String::new();
    ks.push_str(&format!("url {}\n", repo_to_ks(&sources[0], "url")));
    for (idx, source) in sources[1..].iter().enumerate() {
        ks.push_str(&format!(
            "repo --name=\"composer-{idx}\" {}\n",
            repo_to_ks(source, "baseurl")
        ));
    }
    if let Some(repo_dir) = &gitrpm_repo {
        ks.push_str(&format!(
            "repo --name=\"gitrpms\" --baseurl=\"file://{}\"\n",
            repo_dir.display()
        ));
    }
    ks.push_str("clearpart --all --initlabel\n");
    ks.push_str(&format!("part / --size={}\n", partition_bytes.div_ceil(MIB)));
    ks.push_str(&customize_template(&ks_template, &recipe)?);
    for dep in &deps {
        ks.push_str(&dep.nevra());
        ks.push('\n');
    }
    if let Some(repo_dir) = &gitrpm_repo {
        for name in gitrpm::gitrpm_package_names(repo_dir)? {
            ks.push_str(&name);
            ks.push('\n');
        }
    }
    ks.push_str("%end\n");
    ks.push_str(&post_customizations(&recipe)?);
    fs::write(&ks_path, ks)?;

    // Builder configuration: per-type arguments plus host identity.
    let os_release = os_release_fields(&cfg.paths.os_release);
    let mut compose = compose_args(compose_type)
        .ok_or_else(|| ComposeError::BadType(compose_type.to_string(), Vec::new()))?;
    if compose.compression.is_none() {
        compose.compression = Some("xz".to_string());
    }
    if compose.compress_args.is_none() {
        compose.compress_args = Some(Vec::new());
    }
    let config = BuilderConfig {
        compose,
        title: os_release.get("PRETTY_NAME").cloned().unwrap_or_default(),
        project: os_release.get("NAME").cloned().unwrap_or_default(),
        releasever: os_release.get("VERSION_ID").cloned().unwrap_or_default(),
        volid: String::new(),
        extra_boot_args: kernel_append(&recipe),
        ks: vec![ks_path.display().to_string()],
        logfile: results_dir.join("logs").display().to_string() + "/",
        timeout: 60,
    };
    fs::write(results_dir.join("config.toml"), toml::to_string(&config)?)?;

    // Status and hand-off. The symlink creation is the atomic enqueue.
    queue::write_status(&results_dir, BuildStatus::Waiting)?;
    if test_mode > 0 {
        fs::write(results_dir.join("TEST"), test_mode.to_string())?;
    }
    queue::write_timestamp(&results_dir, queue::TS_CREATED)?;

    info!(build = %build_id, blueprint = %recipe.name, compose_type,
          "adding build to compose queue");
    std::os::unix::fs::symlink(&results_dir, lib_dir.join("queue/new").join(build_id.to_string()))?;

    Ok(build_id)
}
