//! Command line and environment block for a backend launch.

use std::collections::BTreeMap;

use crate::config::schema::ApplicationConfig;

/// Placeholder replaced with the selected port in the path and arguments.
pub const PORT_PLACEHOLDER: &str = "%ASPNETCORE_PORT%";

pub const ENV_PORT: &str = "ASPNETCORE_PORT";
pub const ENV_APP_PATH: &str = "ASPNETCORE_APPL_PATH";
pub const ENV_TOKEN: &str = "ASPNETCORE_TOKEN";
pub const ENV_HTTP_AUTH: &str = "ASPNETCORE_IIS_HTTPAUTH";
pub const ENV_WEBSOCKETS: &str = "ASPNETCORE_IIS_WEBSOCKETS_SUPPORTED";
pub const ENV_HOSTING_STARTUP: &str = "ASPNETCORE_HOSTINGSTARTUPASSEMBLIES";

/// Everything needed to spawn one backend process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn build(config: &ApplicationConfig, port: u16, token: &str, websocket_supported: bool) -> Self {
        let port_text = port.to_string();
        let program = expand_port(&config.process_path, &port_text);
        let args = split_arguments(&expand_port(&config.arguments, &port_text));

        Self {
            program,
            args,
            env: build_environment(config, &port_text, token, websocket_supported),
        }
    }
}

fn expand_port(value: &str, port: &str) -> String {
    // The placeholder is matched case-insensitively.
    let lower = value.to_ascii_lowercase();
    let needle = PORT_PLACEHOLDER.to_ascii_lowercase();
    let mut out = String::with_capacity(value.len());
    let mut last = 0;
    for (idx, _) in lower.match_indices(&needle) {
        out.push_str(&value[last..idx]);
        out.push_str(port);
        last = idx + needle.len();
    }
    out.push_str(&value[last..]);
    out
}

/// Split a command-line string into arguments, honouring double quotes.
pub fn split_arguments(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            '\\' if chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

fn build_environment(
    config: &ApplicationConfig,
    port: &str,
    token: &str,
    websocket_supported: bool,
) -> BTreeMap<String, String> {
    let mut env = config.environment.clone();

    let configured_assemblies = env.remove(ENV_HOSTING_STARTUP).unwrap_or_default();
    let assemblies = merge_assemblies(&configured_assemblies, &config.hosting_startup_assemblies);
    if !assemblies.is_empty() {
        env.insert(ENV_HOSTING_STARTUP.to_string(), assemblies);
    }

    let auth = &config.authentication;
    let mut http_auth = String::new();
    if auth.windows {
        http_auth.push_str("windows;");
    }
    if auth.basic {
        http_auth.push_str("basic;");
    }
    if auth.anonymous {
        http_auth.push_str("anonymous;");
    }
    env.insert(ENV_HTTP_AUTH.to_string(), http_auth);

    if websocket_supported {
        env.insert(ENV_WEBSOCKETS.to_string(), "true".to_string());
    } else {
        env.remove(ENV_WEBSOCKETS);
    }

    // Generated values win over anything user-configured.
    env.insert(ENV_APP_PATH.to_string(), config.app_path.clone());
    env.insert(ENV_PORT.to_string(), port.to_string());
    env.insert(ENV_TOKEN.to_string(), token.to_string());
    env
}

fn merge_assemblies(configured: &str, required: &[String]) -> String {
    let mut list: Vec<String> = configured
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    for assembly in required {
        if !list.iter().any(|existing| existing.eq_ignore_ascii_case(assembly)) {
            list.push(assembly.clone());
        }
    }
    list.join(";")
}
