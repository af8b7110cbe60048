//! Human-readable tables.

use chrono::{DateTime, Utc};
use drowse_core::state::Protocol;
use drowse_core::{format_idle, idle_duration, EnvironmentRecord, PortMapping};

/// Best-guess URL for a published host port.
pub fn port_url(mapping: &PortMapping) -> String {
    let port = mapping.host_port;
    match mapping.protocol {
        Protocol::Udp => format!("udp://localhost:{port}"),
        Protocol::Tcp => match port {
            80 | 3000 | 4200 | 5000 | 8000 | 8080 => format!("http://localhost:{port}"),
            443 | 8443 => format!("https://localhost:{port}"),
            _ => format!("tcp://localhost:{port}"),
        },
    }
}

/// `ls` table.
pub fn environments_table<'a>(
    envs: impl IntoIterator<Item = &'a EnvironmentRecord>,
    now: DateTime<Utc>,
) -> String {
    let mut out = format!(
        "{:<20} {:<9} {:<24} {:<10} {}\n",
        "NAME", "STATUS", "IMAGE", "IDLE", "PROJECT"
    );
    for env in envs {
        let status = if env.persistent {
            format!("{}*", env.status)
        } else {
            env.status.to_string()
        };
        out.push_str(&format!(
            "{:<20} {:<9} {:<24} {:<10} {}\n",
            env.name,
            status,
            env.image,
            format_idle(idle_duration(env.last_active, now)),
            env.project_path.display()
        ));
    }
    out
}

/// `ports` table, sorted by environment then host port.
pub fn ports_table<'a>(
    envs: impl IntoIterator<Item = &'a EnvironmentRecord>,
    only: Option<&str>,
) -> Option<String> {
    let mut rows: Vec<(&str, PortMapping)> = envs
        .into_iter()
        .filter(|env| only.map_or(true, |name| env.name == name))
        .flat_map(|env| env.ports.iter().map(move |p| (env.name.as_str(), *p)))
        .collect();
    if rows.is_empty() {
        return None;
    }
    rows.sort_by(|a, b| a.0.cmp(b.0).then(a.1.host_port.cmp(&b.1.host_port)));

    let mut out = format!(
        "{:<20} {:<10} {:<15} {:<9} {}\n",
        "ENV", "HOST", "CONTAINER", "PROTOCOL", "URL"
    );
    for (name, mapping) in rows {
        out.push_str(&format!(
            "{:<20} {:<10} {:<15} {:<9} {}\n",
            name,
            mapping.host_port,
            mapping.container_port,
            mapping.protocol,
            port_url(&mapping)
        ));
    }
    Some(out)
}
