//! A minimal UCI-flavoured text parser: `config <type> ['<name>']`
//! sections containing `option <key> '<value>'` and `list <key>
//! '<value>'` lines. Deliberately smaller than full UCI — no
//! `@indexed[]` sections, no `uci` CLI compatibility — this exists so
//! the daemon has a complete, working config layer, not a stub.

use std::collections::HashMap;

use netifd_core::device::{DeviceConfig, DeviceFlags, DeviceKind};
use netifd_core::interface::InterfaceConfig;

use super::ParsedConfig;

struct Section {
    kind: String,
    name: Option<String>,
    options: HashMap<String, String>,
    lists: HashMap<String, Vec<String>>,
}

/// Parses `text` into a [`ParsedConfig`].
///
/// # Errors
/// Returns a human-readable reason if a line doesn't parse, or an
/// `interface` section has no name.
pub fn parse(text: &str) -> Result<ParsedConfig, String> {
    let mut sections = Vec::new();
    let mut current: Option<Section> = None;

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens = tokenize(line);
        if tokens.is_empty() {
            continue;
        }

        match tokens[0].as_str() {
            "config" => {
                if let Some(section) = current.take() {
                    sections.push(section);
                }
                let kind = tokens
                    .get(1)
                    .ok_or_else(|| format!("line {}: `config` with no type", lineno + 1))?
                    .clone();
                let name = tokens.get(2).cloned();
                current = Some(Section { kind, name, options: HashMap::new(), lists: HashMap::new() });
            }
            "option" => {
                let section = current
                    .as_mut()
                    .ok_or_else(|| format!("line {}: `option` outside any `config` section", lineno + 1))?;
                let key = tokens.get(1).ok_or_else(|| format!("line {}: `option` with no key", lineno + 1))?;
                let value = tokens.get(2).ok_or_else(|| format!("line {}: `option` with no value", lineno + 1))?;
                section.options.insert(key.clone(), value.clone());
            }
            "list" => {
                let section = current
                    .as_mut()
                    .ok_or_else(|| format!("line {}: `list` outside any `config` section", lineno + 1))?;
                let key = tokens.get(1).ok_or_else(|| format!("line {}: `list` with no key", lineno + 1))?;
                let value = tokens.get(2).ok_or_else(|| format!("line {}: `list` with no value", lineno + 1))?;
                section.lists.entry(key.clone()).or_default().push(value.clone());
            }
            other => return Err(format!("line {}: unrecognized keyword `{other}`", lineno + 1)),
        }
    }
    if let Some(section) = current.take() {
        sections.push(section);
    }

    let mut parsed = ParsedConfig::default();
    for section in sections {
        match section.kind.as_str() {
            "device" => parsed.devices.push(device_from_section(section)?),
            "interface" => parsed.interfaces.push(interface_from_section(section)?),
            _ => {
                // Sections this daemon doesn't model (e.g. `config
                // globals`) are accepted and ignored rather than
                // rejected, matching the "minimal, not full UCI" scope.
            }
        }
    }
    Ok(parsed)
}

fn device_from_section(section: Section) -> Result<(String, DeviceConfig), String> {
    let name = section
        .name
        .clone()
        .or_else(|| section.options.get("name").cloned())
        .ok_or_else(|| "a `config device` section needs a name or an `option name`".to_string())?;

    let kind = match section.options.get("type").map(String::as_str) {
        Some("bridge") => DeviceKind::Bridge { members: section.lists.get("ports").cloned().unwrap_or_default() },
        _ => DeviceKind::Simple,
    };

    let mut flags = DeviceFlags::empty();
    let mtu = parse_opt_u32(&section, "mtu", DeviceFlags::MTU_SET, &mut flags)?;
    let txqueuelen = parse_opt_u32(&section, "txqueuelen", DeviceFlags::TXQUEUELEN_SET, &mut flags)?;
    let mac = match section.options.get("macaddr") {
        Some(raw) => {
            flags |= DeviceFlags::MAC_SET;
            Some(parse_mac(raw)?)
        }
        None => None,
    };

    Ok((name, DeviceConfig { kind, flags, mtu, mac, txqueuelen }))
}

fn interface_from_section(section: Section) -> Result<(String, InterfaceConfig), String> {
    let name = section
        .name
        .clone()
        .ok_or_else(|| "a `config interface` section needs a quoted name".to_string())?;

    let ifname = section.options.get("ifname").cloned().unwrap_or_default();
    let proto = section.options.get("proto").cloned().unwrap_or_else(|| "static".to_string());
    let autostart = parse_bool(section.options.get("auto"), true);
    let defaultroute = parse_bool(section.options.get("defaultroute"), true);
    let metric = match section.options.get("metric") {
        Some(raw) => raw.parse::<u32>().map_err(|_| format!("interface {name}: metric {raw:?} is not a number"))?,
        None => 0,
    };

    let mut proto_config = serde_json::Map::new();
    proto_config.insert("__proto".to_string(), serde_json::Value::String(proto.clone()));
    if !ifname.is_empty() {
        proto_config.insert("__main_ifname".to_string(), serde_json::Value::String(ifname.clone()));
    }
    for (key, value) in &section.options {
        if matches!(key.as_str(), "ifname" | "proto" | "auto" | "defaultroute" | "metric") {
            continue;
        }
        proto_config.insert(key.clone(), serde_json::Value::String(value.clone()));
    }

    Ok((
        name,
        InterfaceConfig {
            ifname,
            proto,
            proto_config: serde_json::Value::Object(proto_config),
            autostart,
            metric,
            no_defaultroute: !defaultroute,
        },
    ))
}

fn parse_opt_u32(section: &Section, key: &str, flag: DeviceFlags, flags: &mut DeviceFlags) -> Result<Option<u32>, String> {
    match section.options.get(key) {
        Some(raw) => {
            let value = raw.parse::<u32>().map_err(|_| format!("option {key} {raw:?} is not a number"))?;
            *flags |= flag;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn parse_mac(raw: &str) -> Result<[u8; 6], String> {
    let mut octets = [0u8; 6];
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 6 {
        return Err(format!("macaddr {raw:?} must have 6 colon-separated octets"));
    }
    for (slot, part) in octets.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16).map_err(|_| format!("macaddr {raw:?} has a non-hex octet"))?;
    }
    Ok(octets)
}

fn parse_bool(value: Option<&String>, default: bool) -> bool {
    match value.map(String::as_str) {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

/// Splits one line into whitespace-separated tokens, treating `'...'`
/// and `"..."` spans as single tokens with the quotes stripped.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            chars.next();
            let mut token = String::new();
            for c in chars.by_ref() {
                if c == quote {
                    break;
                }
                token.push(c);
            }
            tokens.push(token);
            continue;
        }
        let mut token = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            token.push(c);
            chars.next();
        }
        tokens.push(token);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_handles_mixed_quoting() {
        assert_eq!(tokenize("option ifname 'eth0'"), vec!["option", "ifname", "eth0"]);
        assert_eq!(tokenize("config interface lan"), vec!["config", "interface", "lan"]);
        assert_eq!(tokenize(r#"option proto "dhcp""#), vec!["option", "proto", "dhcp"]);
    }

    #[test]
    fn unrecognized_keyword_is_rejected() {
        assert!(parse("frobnicate 'lan'").is_err());
    }

    #[test]
    fn anonymous_device_section_falls_back_to_option_name() {
        let parsed = parse("config device\n    option name 'eth0.10'\n").expect("valid");
        assert_eq!(parsed.devices[0].0, "eth0.10");
    }

    #[test]
    fn interface_without_a_name_is_rejected() {
        assert!(parse("config interface\n    option ifname 'eth0'\n").is_err());
    }
}
