//! Kickstart directive parsing and serialization
//!
//! Each directive the customization engine touches has a struct with explicit
//! fields and a parse/serialize pair. Directives are always parsed, mutated
//! in struct form, and re-serialized; options are never spliced together by
//! string concatenation, so quoting survives a round trip.

use super::CustomizeError;

/// Tokenize a directive line, honoring shell-style quoting.
fn tokenize(line: &str) -> Result<Vec<String>, CustomizeError> {
    shell_words::split(line)
        .map_err(|e| CustomizeError::BadDirective(format!("{line}: {e}")))
}

/// Pull `--flag=value` or `--flag value` out of a token stream.
struct FlagParser {
    tokens: std::vec::IntoIter<String>,
    peeked: Option<String>,
}

impl FlagParser {
    fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens: tokens.into_iter(),
            peeked: None,
        }
    }

    fn next_token(&mut self) -> Option<String> {
        self.peeked.take().or_else(|| self.tokens.next())
    }

    /// If `token` is the given flag, return its value, consuming the next
    /// token for the space-separated form.
    fn flag_value(&mut self, token: &str, flag: &str) -> Option<String> {
        if let Some(value) = token.strip_prefix(&format!("--{flag}=")) {
            return Some(value.to_string());
        }
        if token == format!("--{flag}") {
            if let Some(next) = self.tokens.next() {
                if !next.starts_with("--") {
                    return Some(next);
                }
                self.peeked = Some(next);
            }
            return Some(String::new());
        }
        None
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn sorted_union(a: &[String], b: &[String]) -> Vec<String> {
    let mut out: Vec<String> = a.iter().chain(b.iter()).cloned().collect();
    out.sort();
    out.dedup();
    out
}

/// `bootloader [--location=...] [--append="..."]`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BootloaderDirective {
    pub location: Option<String>,
    pub append: Option<String>,
    pub extra: Vec<String>,
}

impl BootloaderDirective {
    pub fn parse(line: &str) -> Result<Self, CustomizeError> {
        let mut parser = FlagParser::new(tokenize(line)?);
        parser.next_token(); // directive name
        let mut out = Self::default();
        while let Some(token) = parser.next_token() {
            if let Some(v) = parser.flag_value(&token, "location") {
                out.location = Some(v);
            } else if let Some(v) = parser.flag_value(&token, "append") {
                out.append = Some(v);
            } else {
                out.extra.push(token);
            }
        }
        Ok(out)
    }

    /// Concatenate `kernel_append` onto the existing append arguments with a
    /// single space separator.
    pub fn append_args(&mut self, kernel_append: &str) {
        self.append = match self.append.take() {
            Some(existing) if !existing.is_empty() => {
                Some(format!("{existing} {kernel_append}"))
            }
            _ => Some(kernel_append.to_string()),
        };
    }

    pub fn to_line(&self) -> String {
        let mut line = "bootloader".to_string();
        if let Some(location) = &self.location {
            line.push_str(&format!(" --location={location}"));
        }
        if let Some(append) = &self.append {
            line.push_str(&format!(" --append=\"{append}\""));
        }
        for extra in &self.extra {
            line.push(' ');
            line.push_str(extra);
        }
        line
    }
}

/// `timezone [--utc] [--ntpservers=a,b] ZONE`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimezoneDirective {
    pub timezone: Option<String>,
    pub ntpservers: Vec<String>,
    pub utc: bool,
}

impl TimezoneDirective {
    pub fn parse(line: &str) -> Result<Self, CustomizeError> {
        let mut parser = FlagParser::new(tokenize(line)?);
        parser.next_token();
        let mut out = Self::default();
        while let Some(token) = parser.next_token() {
            if token == "--utc" || token == "--isUtc" {
                out.utc = true;
            } else if let Some(v) = parser.flag_value(&token, "ntpservers") {
                out.ntpservers = split_list(&v);
            } else if !token.starts_with("--") {
                out.timezone = Some(token);
            }
        }
        Ok(out)
    }

    pub fn to_line(&self) -> String {
        let mut line = "timezone".to_string();
        if self.utc {
            line.push_str(" --utc");
        }
        if !self.ntpservers.is_empty() {
            line.push_str(&format!(" --ntpservers={}", self.ntpservers.join(",")));
        }
        if let Some(tz) = &self.timezone {
            line.push(' ');
            line.push_str(tz);
        }
        line
    }
}

/// `lang PRIMARY [--addsupport=a,b]`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LangDirective {
    pub lang: Option<String>,
    pub addsupport: Vec<String>,
}

impl LangDirective {
    pub fn parse(line: &str) -> Result<Self, CustomizeError> {
        let mut parser = FlagParser::new(tokenize(line)?);
        parser.next_token();
        let mut out = Self::default();
        while let Some(token) = parser.next_token() {
            if let Some(v) = parser.flag_value(&token, "addsupport") {
                out.addsupport = split_list(&v);
            } else if !token.starts_with("--") {
                out.lang = Some(token);
            }
        }
        Ok(out)
    }

    /// First element becomes the primary language, the remainder becomes
    /// `--addsupport`.
    pub fn set_languages(&mut self, languages: &[String]) {
        if let Some(first) = languages.first() {
            self.lang = Some(first.clone());
            self.addsupport = languages[1..].to_vec();
        }
    }

    pub fn to_line(&self) -> String {
        let mut line = "lang".to_string();
        if let Some(lang) = &self.lang {
            line.push(' ');
            line.push_str(lang);
        }
        if !self.addsupport.is_empty() {
            line.push_str(&format!(" --addsupport={}", self.addsupport.join(",")));
        }
        line
    }
}

/// `keyboard [--vckeymap=...] [--xlayouts=a,b] [LAYOUT]`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyboardDirective {
    pub keyboard: Option<String>,
    pub vckeymap: Option<String>,
    pub xlayouts: Vec<String>,
}

impl KeyboardDirective {
    pub fn parse(line: &str) -> Result<Self, CustomizeError> {
        let mut parser = FlagParser::new(tokenize(line)?);
        parser.next_token();
        let mut out = Self::default();
        while let Some(token) = parser.next_token() {
            if let Some(v) = parser.flag_value(&token, "vckeymap") {
                out.vckeymap = Some(v);
            } else if let Some(v) = parser.flag_value(&token, "xlayouts") {
                out.xlayouts = split_list(&v);
            } else if !token.starts_with("--") {
                out.keyboard = Some(token);
            }
        }
        Ok(out)
    }

    /// Setting the layout clears `--vckeymap` and `--xlayouts` so the
    /// blueprint's layout does not conflict with template defaults.
    pub fn set_layout(&mut self, layout: &str) {
        self.keyboard = Some(layout.to_string());
        self.vckeymap = None;
        self.xlayouts.clear();
    }

    pub fn to_line(&self) -> String {
        let mut line = "keyboard".to_string();
        if let Some(vckeymap) = &self.vckeymap {
            line.push_str(&format!(" --vckeymap={vckeymap}"));
        }
        if !self.xlayouts.is_empty() {
            line.push_str(&format!(" --xlayouts={}", self.xlayouts.join(",")));
        }
        if let Some(keyboard) = &self.keyboard {
            line.push(' ');
            line.push_str(&shell_words::quote(keyboard));
        }
        line
    }
}

/// `firewall --enabled|--disabled [--port=..] [--service=..] [--remove-service=..]`
#[derive(Debug, Clone, PartialEq)]
pub struct FirewallDirective {
    pub enabled: bool,
    pub ports: Vec<String>,
    pub services: Vec<String>,
    pub remove_services: Vec<String>,
}

impl Default for FirewallDirective {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: Vec::new(),
            services: Vec::new(),
            remove_services: Vec::new(),
        }
    }
}

impl FirewallDirective {
    pub fn parse(line: &str) -> Result<Self, CustomizeError> {
        let mut parser = FlagParser::new(tokenize(line)?);
        parser.next_token();
        let mut out = Self::default();
        while let Some(token) = parser.next_token() {
            if token == "--enabled" || token == "--enable" {
                out.enabled = true;
            } else if token == "--disabled" || token == "--disable" {
                out.enabled = false;
            } else if let Some(v) = parser.flag_value(&token, "port") {
                out.ports = split_list(&v);
            } else if let Some(v) = parser.flag_value(&token, "service") {
                out.services = split_list(&v);
            } else if let Some(v) = parser.flag_value(&token, "remove-service") {
                out.remove_services = split_list(&v);
            }
        }
        Ok(out)
    }

    /// Union the blueprint's ports and services into the directive, sorted
    /// ascending. A template `firewall --disabled` is respected: the merge
    /// does not run.
    pub fn merge(&mut self, ports: &[String], enabled: &[String], disabled: &[String]) {
        if !self.enabled {
            return;
        }
        self.ports = sorted_union(&self.ports, ports);
        self.services = sorted_union(&self.services, enabled);
        self.remove_services = sorted_union(&self.remove_services, disabled);
    }

    pub fn to_line(&self) -> String {
        let mut line = "firewall".to_string();
        if self.enabled {
            line.push_str(" --enabled");
        } else {
            line.push_str(" --disabled");
        }
        if !self.ports.is_empty() {
            line.push_str(&format!(" --port={}", self.ports.join(",")));
        }
        if !self.services.is_empty() {
            line.push_str(&format!(" --service={}", self.services.join(",")));
        }
        if !self.remove_services.is_empty() {
            line.push_str(&format!(
                " --remove-service={}",
                self.remove_services.join(",")
            ));
        }
        line
    }
}

/// `services [--enabled=a,b] [--disabled=c,d]`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServicesDirective {
    pub enabled: Vec<String>,
    pub disabled: Vec<String>,
}

impl ServicesDirective {
    pub fn parse(line: &str) -> Result<Self, CustomizeError> {
        let mut parser = FlagParser::new(tokenize(line)?);
        parser.next_token();
        let mut out = Self::default();
        while let Some(token) = parser.next_token() {
            if let Some(v) = parser.flag_value(&token, "enabled") {
                out.enabled = split_list(&v);
            } else if let Some(v) = parser.flag_value(&token, "disabled") {
                out.disabled = split_list(&v);
            }
        }
        Ok(out)
    }

    pub fn merge(&mut self, enabled: &[String], disabled: &[String]) {
        self.enabled = sorted_union(&self.enabled, enabled);
        self.disabled = sorted_union(&self.disabled, disabled);
    }

    pub fn to_line(&self) -> String {
        let mut line = "services".to_string();
        if !self.disabled.is_empty() {
            line.push_str(&format!(" --disabled={}", self.disabled.join(",")));
        }
        if !self.enabled.is_empty() {
            line.push_str(&format!(" --enabled={}", self.enabled.join(",")));
        }
        line
    }
}
