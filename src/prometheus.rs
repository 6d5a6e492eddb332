//! Prometheus text exposition (§6.3): hand-rolled, since nothing in the
//! dependency stack ships a metrics-exposition crate. The supervisor builds
//! the plain `ProcessMetric`/`SystemMetric` inputs from the registry and
//! monitor ring; this module only knows how to format them.
use std::fmt::Write as _;

/// One entry's worth of the five process-level metric families.
#[derive(Debug, Clone)]
pub struct ProcessMetric {
    pub name: String,
    pub id: u64,
    pub status: String,
    pub online: bool,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub restarts_total: u32,
    pub uptime_seconds: u64,
}

/// Host-wide figures backing the three system metric families.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMetric {
    pub memory_total_bytes: u64,
    pub memory_free_bytes: u64,
    pub load_average_1m: f64,
    pub load_average_5m: f64,
    pub load_average_15m: f64,
}

/// Renders one scrape's worth of text exposition for every process plus the
/// system gauges. Family order is fixed; per-family entries follow `processes`'
/// input order.
pub fn render(processes: &[ProcessMetric], system: &SystemMetric) -> String {
    let mut out = String::new();

    write_family(
        &mut out,
        "bm2_process_cpu",
        "gauge",
        "Process CPU usage percent",
        processes,
        |p| format!("{:.2}", p.cpu_percent),
    );
    write_family(
        &mut out,
        "bm2_process_memory_bytes",
        "gauge",
        "Process resident set size in bytes",
        processes,
        |p| p.memory_bytes.to_string(),
    );
    write_family(
        &mut out,
        "bm2_process_restarts_total",
        "counter",
        "Total number of restarts",
        processes,
        |p| p.restarts_total.to_string(),
    );
    write_family(
        &mut out,
        "bm2_process_uptime_seconds",
        "gauge",
        "Seconds since the process last became online",
        processes,
        |p| {
            if p.online {
                p.uptime_seconds.to_string()
            } else {
                "0".to_string()
            }
        },
    );

    let _ = writeln!(out, "# HELP bm2_process_status 1 when online, else 0");
    let _ = writeln!(out, "# TYPE bm2_process_status gauge");
    for process in processes {
        let value = if process.online { 1 } else { 0 };
        let _ = writeln!(
            out,
            "bm2_process_status{{name=\"{}\",id=\"{}\",status=\"{}\"}} {value}",
            process.name, process.id, process.status
        );
    }

    let _ = writeln!(out, "# HELP bm2_system_memory_total_bytes Total system memory in bytes");
    let _ = writeln!(out, "# TYPE bm2_system_memory_total_bytes gauge");
    let _ = writeln!(out, "bm2_system_memory_total_bytes {}", system.memory_total_bytes);

    let _ = writeln!(out, "# HELP bm2_system_memory_free_bytes Free system memory in bytes");
    let _ = writeln!(out, "# TYPE bm2_system_memory_free_bytes gauge");
    let _ = writeln!(out, "bm2_system_memory_free_bytes {}", system.memory_free_bytes);

    let _ = writeln!(out, "# HELP bm2_system_load_average System load average");
    let _ = writeln!(out, "# TYPE bm2_system_load_average gauge");
    let _ = writeln!(
        out,
        "bm2_system_load_average{{period=\"1m\"}} {}",
        system.load_average_1m
    );
    let _ = writeln!(
        out,
        "bm2_system_load_average{{period=\"5m\"}} {}",
        system.load_average_5m
    );
    let _ = writeln!(
        out,
        "bm2_system_load_average{{period=\"15m\"}} {}",
        system.load_average_15m
    );

    out
}

fn write_family(
    out: &mut String,
    name: &str,
    metric_type: &str,
    help: &str,
    processes: &[ProcessMetric],
    value_of: impl Fn(&ProcessMetric) -> String,
) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {metric_type}");
    for process in processes {
        let _ = writeln!(
            out,
            "{name}{{name=\"{}\",id=\"{}\"}} {}",
            process.name,
            process.id,
            value_of(process)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProcessMetric {
        ProcessMetric {
            name: "api".to_string(),
            id: 1,
            status: "online".to_string(),
            online: true,
            cpu_percent: 12.5,
            memory_bytes: 1024,
            restarts_total: 2,
            uptime_seconds: 60,
        }
    }

    #[test]
    fn every_family_carries_help_and_type_lines() {
        let text = render(&[sample()], &SystemMetric::default());
        for family in [
            "bm2_process_cpu",
            "bm2_process_memory_bytes",
            "bm2_process_restarts_total",
            "bm2_process_uptime_seconds",
            "bm2_process_status",
            "bm2_system_memory_total_bytes",
            "bm2_system_memory_free_bytes",
            "bm2_system_load_average",
        ] {
            assert!(text.contains(&format!("# HELP {family}")));
            assert!(text.contains(&format!("# TYPE {family}")));
        }
    }

    #[test]
    fn offline_process_reports_zero_uptime() {
        let mut process = sample();
        process.online = false;
        process.uptime_seconds = 999;
        let text = render(&[process], &SystemMetric::default());
        assert!(text.contains("bm2_process_uptime_seconds{name=\"api\",id=\"1\"} 0"));
        assert!(text.contains("bm2_process_status{name=\"api\",id=\"1\",status=\"online\"} 0"));
    }

    #[test]
    fn labels_carry_name_and_id() {
        let text = render(&[sample()], &SystemMetric::default());
        assert!(text.contains("bm2_process_cpu{name=\"api\",id=\"1\"} 12.50"));
    }
}
