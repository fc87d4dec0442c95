//! Customization engine
//!
//! Takes a kickstart template (directive lines followed by a `%packages`
//! section that is left open for the composer) and a blueprint, and splices
//! the blueprint's customizations into the template:
//!
//! 1. Walk the template line by line. Lines matching a known directive are
//!    merged with the blueprint value when the directive's replace policy
//!    allows it; everything else passes through untouched.
//! 2. Directives the template does not carry are synthesized from their
//!    defaults and prepended, so they land before `%packages`.
//!
//! User, group, hostname, and ssh key customizations cannot appear before
//! `%packages`; the composer appends them after `%end` via
//! [`post_customizations`].

pub mod directives;

use thiserror::Error;
use tracing::{debug, warn};

use crate::blueprint::{Blueprint, Customizations};

pub use directives::{
    BootloaderDirective, FirewallDirective, KeyboardDirective, LangDirective, ServicesDirective,
    TimezoneDirective,
};

#[derive(Debug, Error)]
pub enum CustomizeError {
    #[error("Malformed kickstart directive: {0}")]
    BadDirective(String),

    #[error("user entry requires a name")]
    MissingUserName,

    #[error("group entry requires a name")]
    MissingGroupName,
}

/// The six template directives the engine recognizes, in splice order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Bootloader,
    Timezone,
    Lang,
    Keyboard,
    Firewall,
    Services,
}

const DIRECTIVES: [Directive; 6] = [
    Directive::Bootloader,
    Directive::Timezone,
    Directive::Lang,
    Directive::Keyboard,
    Directive::Firewall,
    Directive::Services,
];

impl Directive {
    fn name(self) -> &'static str {
        match self {
            Directive::Bootloader => "bootloader",
            Directive::Timezone => "timezone",
            Directive::Lang => "lang",
            Directive::Keyboard => "keyboard",
            Directive::Firewall => "firewall",
            Directive::Services => "services",
        }
    }

    /// The complete default directive line, or empty when the directive
    /// should be omitted entirely.
    fn default_line(self, custom: &Customizations) -> String {
        match self {
            Directive::Bootloader => "bootloader --location=none".to_string(),
            Directive::Timezone => "timezone UTC".to_string(),
            Directive::Lang => "lang en_US.UTF-8".to_string(),
            Directive::Keyboard => "keyboard --xlayouts us --vckeymap us".to_string(),
            Directive::Firewall => "firewall --enabled".to_string(),
            // With no services selected there is nothing to add.
            Directive::Services => {
                let (enabled, disabled) = services_settings(custom);
                if enabled.is_empty() && disabled.is_empty() {
                    String::new()
                } else {
                    "services".to_string()
                }
            }
        }
    }

    /// Whether the blueprint carries a value for this directive.
    fn has_value(self, custom: &Customizations) -> bool {
        match self {
            Directive::Bootloader => !kernel_append(custom).is_empty(),
            Directive::Timezone => custom
                .timezone
                .as_ref()
                .map(|tz| tz.timezone.is_some() || !tz.ntpservers.is_empty())
                .unwrap_or(false),
            Directive::Lang => custom
                .locale
                .as_ref()
                .map(|l| !l.languages.is_empty())
                .unwrap_or(false),
            Directive::Keyboard => custom
                .locale
                .as_ref()
                .and_then(|l| l.keyboard.as_deref())
                .map(|k| !k.is_empty())
                .unwrap_or(false),
            // Firewall and services merges normalize the line even when the
            // blueprint adds nothing.
            Directive::Firewall | Directive::Services => true,
        }
    }

    /// Replace policy: whether an existing template line may be modified.
    fn replaces(self) -> bool {
        !matches!(self, Directive::Timezone)
    }

    /// Merge the blueprint value into a directive line and re-serialize it.
    fn merge(self, line: &str, custom: &Customizations) -> Result<String, CustomizeError> {
        match self {
            Directive::Bootloader => {
                let mut d = BootloaderDirective::parse(line)?;
                d.append_args(&kernel_append(custom));
                Ok(d.to_line())
            }
            Directive::Timezone => {
                let mut d = TimezoneDirective::parse(line)?;
                if let Some(tz) = &custom.timezone {
                    if let Some(zone) = &tz.timezone {
                        d.timezone = Some(zone.clone());
                    }
                    if !tz.ntpservers.is_empty() {
                        d.ntpservers = tz.ntpservers.clone();
                    }
                }
                Ok(d.to_line())
            }
            Directive::Lang => {
                let mut d = LangDirective::parse(line)?;
                if let Some(locale) = &custom.locale {
                    d.set_languages(&locale.languages);
                }
                Ok(d.to_line())
            }
            Directive::Keyboard => {
                let mut d = KeyboardDirective::parse(line)?;
                if let Some(layout) = custom.locale.as_ref().and_then(|l| l.keyboard.as_deref()) {
                    d.set_layout(layout);
                }
                Ok(d.to_line())
            }
            Directive::Firewall => {
                let mut d = FirewallDirective::parse(line)?;
                let (ports, enabled, disabled) = firewall_settings(custom);
                d.merge(&ports, &enabled, &disabled);
                Ok(d.to_line())
            }
            Directive::Services => {
                // A synthesized bare "services" default parses to the empty
                // directive, so the merge applies to it as well.
                let mut d = ServicesDirective::parse(line)?;
                let (enabled, disabled) = services_settings(custom);
                d.merge(&enabled, &disabled);
                Ok(d.to_line())
            }
        }
    }
}

fn kernel_append(custom: &Customizations) -> String {
    custom
        .kernel
        .as_ref()
        .map(|k| k.append.clone())
        .unwrap_or_default()
}

fn firewall_settings(custom: &Customizations) -> (Vec<String>, Vec<String>, Vec<String>) {
    match &custom.firewall {
        Some(fw) => {
            let (enabled, disabled) = fw
                .services
                .as_ref()
                .map(|s| (s.enabled.clone(), s.disabled.clone()))
                .unwrap_or_default();
            (fw.ports.clone(), enabled, disabled)
        }
        None => Default::default(),
    }
}

fn services_settings(custom: &Customizations) -> (Vec<String>, Vec<String>) {
    custom
        .services
        .as_ref()
        .map(|s| {
            let mut enabled = s.enabled.clone();
            let mut disabled = s.disabled.clone();
            enabled.sort();
            disabled.sort();
            (enabled, disabled)
        })
        .unwrap_or_default()
}

/// Does `line` start with the directive `name` as a whole word?
fn matches_directive(line: &str, name: &str) -> bool {
    line.strip_prefix(name)
        .map(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
        .unwrap_or(false)
}

/// Apply blueprint customizations to the kickstart template.
///
/// Existing directive lines are merged in place (subject to each directive's
/// replace policy); defaults for missing directives are synthesized and
/// prepended so they precede the `%packages` section. The `%packages` header
/// itself passes through unterminated; closing it is the composer's job.
pub fn customize_template(
    template: &str,
    blueprint: &Blueprint,
) -> Result<String, CustomizeError> {
    let empty = Customizations::default();
    let custom = blueprint.customizations.as_ref().unwrap_or(&empty);

    let mut found = [false; DIRECTIVES.len()];
    let mut output = String::new();
    for line in template.lines() {
        let mut handled = false;
        for (idx, directive) in DIRECTIVES.iter().enumerate() {
            if matches_directive(line, directive.name()) {
                found[idx] = true;
                if directive.has_value(custom) && directive.replaces() {
                    debug!(directive = directive.name(), "merging blueprint value");
                    output.push_str(&directive.merge(line, custom)?);
                } else {
                    debug!(directive = directive.name(), "keeping template line");
                    output.push_str(line);
                }
                output.push('\n');
                handled = true;
                break;
            }
        }
        if !handled {
            output.push_str(line);
            output.push('\n');
        }
    }

    // Defaults for directives the template does not carry. These go FIRST:
    // the template still ends with the open %packages section.
    let mut defaults = String::new();
    for (idx, directive) in DIRECTIVES.iter().enumerate() {
        if found[idx] {
            continue;
        }
        let default_line = directive.default_line(custom);
        if directive.has_value(custom) && !default_line.is_empty() {
            defaults.push_str(&directive.merge(&default_line, custom)?);
            defaults.push('\n');
        } else if !default_line.is_empty() {
            defaults.push_str(&default_line);
            defaults.push('\n');
        }
    }

    Ok(defaults + &output)
}

fn is_crypted_password(password: &str) -> bool {
    ["$2b$", "$5$", "$6$"]
        .iter()
        .any(|prefix| password.starts_with(prefix))
}

/// Root cannot be created with a `user` directive; emit `sshkey` and
/// `rootpw` instead. Returns true when a `rootpw` line was written.
fn write_root(out: &mut String, user: &crate::blueprint::UserCustomization) -> bool {
    if let Some(key) = &user.key {
        out.push_str(&format!("sshkey --user {} \"{}\"\n", user.name, key));
    }
    let Some(password) = &user.password else {
        return false;
    };
    if is_crypted_password(password) {
        out.push_str(&format!("rootpw --iscrypted \"{password}\"\n"));
    } else {
        out.push_str(&format!("rootpw --plaintext \"{password}\"\n"));
    }
    true
}

fn write_user(out: &mut String, user: &crate::blueprint::UserCustomization) {
    if let Some(key) = &user.key {
        out.push_str(&format!("sshkey --user {} \"{}\"\n", user.name, key));
    }
    out.push_str(&format!("user --name {}", user.name));
    if let Some(home) = &user.home {
        out.push_str(&format!(" --homedir {home}"));
    }
    if let Some(password) = &user.password {
        if is_crypted_password(password) {
            out.push_str(" --iscrypted");
        } else {
            out.push_str(" --plaintext");
        }
        out.push_str(&format!(" --password \"{password}\""));
    }
    if let Some(shell) = &user.shell {
        out.push_str(&format!(" --shell {shell}"));
    }
    if let Some(uid) = user.uid {
        out.push_str(&format!(" --uid {uid}"));
    }
    if let Some(gid) = user.gid {
        out.push_str(&format!(" --gid {gid}"));
    }
    if let Some(description) = &user.description {
        out.push_str(&format!(" --gecos \"{description}\""));
    }
    if !user.groups.is_empty() {
        out.push_str(&format!(" --groups {}", user.groups.join(",")));
    }
    out.push('\n');
}

/// The customizations that go after the `%end` of the packages section:
/// hostname, ssh keys, users, and groups. A kickstart must always carry a
/// `rootpw` line; the root account is locked unless a root password was
/// given.
pub fn post_customizations(blueprint: &Blueprint) -> Result<String, CustomizeError> {
    let mut out = String::new();
    let Some(custom) = &blueprint.customizations else {
        out.push_str("rootpw --lock\n");
        return Ok(out);
    };

    if let Some(hostname) = &custom.hostname {
        out.push_str(&format!("network --hostname={hostname}\n"));
    }

    // Legacy sshkey entries; the user list below is the preferred spelling.
    for sshkey in &custom.sshkey {
        if sshkey.user.is_empty() || sshkey.key.is_empty() {
            warn!(user = %sshkey.user, "incomplete sshkey entry, skipping");
            continue;
        }
        out.push_str(&format!("sshkey --user {} \"{}\"\n", sshkey.user, sshkey.key));
    }

    // Creating a user also creates its group; remember the names so a
    // duplicate group entry can be skipped.
    let mut user_groups: Vec<&str> = Vec::new();
    let mut wrote_rootpw = false;
    for user in &custom.user {
        if user.name.is_empty() {
            return Err(CustomizeError::MissingUserName);
        }
        if user.name == "root" {
            wrote_rootpw = write_root(&mut out, user) || wrote_rootpw;
            continue;
        }
        write_user(&mut out, user);
        user_groups.push(&user.name);
    }

    for group in &custom.group {
        if group.name.is_empty() {
            return Err(CustomizeError::MissingGroupName);
        }
        if user_groups.contains(&group.name.as_str()) {
            warn!(group = %group.name, "skipping group, already created by user");
            continue;
        }
        out.push_str(&format!("group --name {}", group.name));
        if let Some(gid) = group.gid {
            out.push_str(&format!(" --gid {gid}"));
        }
        out.push('\n');
    }

    if !wrote_rootpw {
        out.push_str("rootpw --lock\n");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::Blueprint;
    use pretty_assertions::assert_eq;

    const TEMPLATE: &str = "\
# Minimal template
keyboard --xlayouts=us --vckeymap=us
lang en_US.UTF-8
timezone US/Samoa
bootloader --location=mbr

%packages
kernel
-dracut-config-rescue
";

    fn blueprint(customizations: &str) -> Blueprint {
        Blueprint::from_toml(&format!(
            "name = \"custom\"\nversion = \"0.0.1\"\n{customizations}"
        ))
        .unwrap()
    }

    #[test]
    fn no_customizations_only_injects_missing_defaults() {
        let bp = blueprint("");
        let out = customize_template(TEMPLATE, &bp).unwrap();
        // firewall is the only missing directive with a non-empty default;
        // it is prepended ahead of the template body.
        assert!(out.starts_with("firewall --enabled\n"));
        assert!(out.contains("keyboard --xlayouts=us --vckeymap=us\n"));
        assert!(out.contains("lang en_US.UTF-8\n"));
        assert!(out.contains("timezone US/Samoa\n"));
        assert!(out.contains("bootloader --location=mbr\n"));
        assert!(out.contains("%packages\nkernel\n"));
        assert!(!out.contains("services"));
    }

    #[test]
    fn kernel_append_merges_into_existing_bootloader() {
        let bp = blueprint("[customizations.kernel]\nappend = \"nosmt=force\"\n");
        let out = customize_template(TEMPLATE, &bp).unwrap();
        assert!(out.contains("bootloader --location=mbr --append=\"nosmt=force\"\n"));
    }

    #[test]
    fn kernel_append_synthesizes_bootloader_when_missing() {
        let template = "lang en_US.UTF-8\n\n%packages\nkernel\n";
        let bp = blueprint("[customizations.kernel]\nappend = \"nosmt=force\"\n");
        let out = customize_template(template, &bp).unwrap();
        assert!(out.contains("bootloader --location=none --append=\"nosmt=force\"\n"));
        // Synthesized lines precede the %packages section.
        let bootloader_at = out.find("bootloader").unwrap();
        let packages_at = out.find("%packages").unwrap();
        assert!(bootloader_at < packages_at);
    }

    #[test]
    fn template_timezone_is_never_overwritten() {
        let bp = blueprint("[customizations.timezone]\ntimezone = \"Europe/Berlin\"\n");
        let out = customize_template(TEMPLATE, &bp).unwrap();
        assert!(out.contains("timezone US/Samoa\n"));
        assert!(!out.contains("Europe/Berlin"));
    }

    #[test]
    fn timezone_default_uses_blueprint_value() {
        let template = "lang en_US.UTF-8\n\n%packages\nkernel\n";
        let bp = blueprint(
            "[customizations.timezone]\ntimezone = \"Europe/Berlin\"\nntpservers = [\"0.pool.ntp.org\"]\n",
        );
        let out = customize_template(template, &bp).unwrap();
        assert!(out.contains("timezone --ntpservers=0.pool.ntp.org Europe/Berlin\n"));
    }

    #[test]
    fn languages_replace_template_lang() {
        let bp = blueprint(
            "[customizations.locale]\nlanguages = [\"sr_RS.UTF-8\", \"es_ES.UTF-8\"]\n",
        );
        let out = customize_template(TEMPLATE, &bp).unwrap();
        assert!(out.contains("lang sr_RS.UTF-8 --addsupport=es_ES.UTF-8\n"));
    }

    #[test]
    fn keyboard_replaces_and_clears_defaults() {
        let bp = blueprint("[customizations.locale]\nkeyboard = \"de (dvorak)\"\n");
        let out = customize_template(TEMPLATE, &bp).unwrap();
        assert!(out.contains("keyboard 'de (dvorak)'\n"));
        assert!(!out.contains("--vckeymap"));
    }

    #[test]
    fn firewall_merges_with_template_settings() {
        let template = "firewall --enabled --port=22:tcp\n\n%packages\nkernel\n";
        let bp = blueprint(
            "[customizations.firewall]\nports = [\"80:tcp\"]\n[customizations.firewall.services]\nenabled = [\"ssh\"]\ndisabled = [\"telnet\"]\n",
        );
        let out = customize_template(template, &bp).unwrap();
        assert!(out.contains(
            "firewall --enabled --port=22:tcp,80:tcp --service=ssh --remove-service=telnet\n"
        ));
    }

    #[test]
    fn disabled_template_firewall_wins() {
        let template = "firewall --disabled\n\n%packages\nkernel\n";
        let bp = blueprint("[customizations.firewall]\nports = [\"80:tcp\"]\n");
        let out = customize_template(template, &bp).unwrap();
        assert!(out.contains("firewall --disabled\n"));
        assert!(!out.contains("80:tcp"));
    }

    #[test]
    fn services_directive_synthesized_only_when_needed() {
        let template = "lang en_US.UTF-8\n\n%packages\nkernel\n";
        let bp = blueprint(
            "[customizations.services]\nenabled = [\"sshd\", \"cockpit.socket\"]\ndisabled = [\"postfix\"]\n",
        );
        let out = customize_template(template, &bp).unwrap();
        assert!(out.contains("services --disabled=postfix --enabled=cockpit.socket,sshd\n"));

        let plain = blueprint("");
        let out = customize_template(template, &plain).unwrap();
        assert!(!out.contains("services"));
    }

    #[test]
    fn untouched_template_passes_through() {
        let bp = blueprint("");
        let out = customize_template(TEMPLATE, &bp).unwrap();
        // Every original line is still present, in order.
        let mut last = 0;
        for line in TEMPLATE.lines() {
            let at = out[last..].find(line).expect("line preserved");
            last += at;
        }
    }

    #[test]
    fn root_user_becomes_rootpw_and_sshkey() {
        let bp = blueprint(
            "[[customizations.user]]\nname = \"root\"\npassword = \"$6$qqqq\"\nkey = \"ssh-rsa AAAA root@host\"\n",
        );
        let out = post_customizations(&bp).unwrap();
        assert!(out.contains("sshkey --user root \"ssh-rsa AAAA root@host\"\n"));
        assert!(out.contains("rootpw --iscrypted \"$6$qqqq\"\n"));
        assert!(!out.contains("user --name root"));
        assert!(!out.contains("rootpw --lock"));
    }

    #[test]
    fn plaintext_root_password_is_marked() {
        let bp = blueprint("[[customizations.user]]\nname = \"root\"\npassword = \"s3kret\"\n");
        let out = post_customizations(&bp).unwrap();
        assert!(out.contains("rootpw --plaintext \"s3kret\"\n"));
    }

    #[test]
    fn missing_root_password_locks_root() {
        let bp = blueprint("[[customizations.user]]\nname = \"admin\"\n");
        let out = post_customizations(&bp).unwrap();
        assert!(out.contains("user --name admin\n"));
        assert!(out.ends_with("rootpw --lock\n"));
    }

    #[test]
    fn full_user_entry_renders_all_flags() {
        let bp = blueprint(
            r#"[[customizations.user]]
name = "admin"
description = "Widget admin account"
password = "$6$CHO2$3rN8eviE2t50lmVyBYihTgVRHcaecmeCk31L"
home = "/srv/widget/"
shell = "/usr/bin/false"
groups = ["wheel", "users"]
uid = 1200
gid = 1200
"#,
        );
        let out = post_customizations(&bp).unwrap();
        assert!(out.contains(
            "user --name admin --homedir /srv/widget/ --iscrypted --password \"$6$CHO2$3rN8eviE2t50lmVyBYihTgVRHcaecmeCk31L\" --shell /usr/bin/false --uid 1200 --gid 1200 --gecos \"Widget admin account\" --groups wheel,users\n"
        ));
    }

    #[test]
    fn group_matching_user_is_skipped() {
        let bp = blueprint(
            "[[customizations.user]]\nname = \"admin\"\n[[customizations.group]]\nname = \"admin\"\n[[customizations.group]]\nname = \"storage\"\ngid = 9000\n",
        );
        let out = post_customizations(&bp).unwrap();
        assert!(!out.contains("group --name admin"));
        assert!(out.contains("group --name storage --gid 9000\n"));
    }

    #[test]
    fn group_without_name_is_fatal() {
        let bp = blueprint("[[customizations.group]]\ngid = 9000\n");
        assert!(matches!(
            post_customizations(&bp),
            Err(CustomizeError::MissingGroupName)
        ));
    }

    #[test]
    fn hostname_becomes_network_line() {
        let bp = blueprint("[customizations]\nhostname = \"testy.example.com\"\n");
        let out = post_customizations(&bp).unwrap();
        assert!(out.starts_with("network --hostname=testy.example.com\n"));
    }

    #[test]
    fn no_customizations_still_locks_root() {
        let bp = blueprint("");
        assert_eq!(post_customizations(&bp).unwrap(), "rootpw --lock\n");
    }
}
