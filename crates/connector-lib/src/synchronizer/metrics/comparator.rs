//! Registration priority of metrics
//!
//! When more metrics are waiting than a pass may register, the ones shown
//! on default dashboards go first, and high-cardinality items go last.
//!
//! Weight tiers, lower first:
//! - essential metric without item
//! - essential metric with a plain item (disk IO device, cpu variant)
//! - network or filesystem metric on a significant item
//! - other built-in metric without item (service status, pending updates)
//! - other built-in metric with an item
//! - network or filesystem metric on any other item
//! - container metric
//! - custom metric

use crate::labels::{metric_name, Labels, ITEM};
use crate::models::MetricFormat;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::OnceLock;

const BLEEMEO_ESSENTIALS: &[&str] = &[
    "agent_status",
    "cpu_idle",
    "cpu_interrupt",
    "cpu_nice",
    "cpu_other",
    "cpu_softirq",
    "cpu_steal",
    "cpu_system",
    "cpu_used",
    "cpu_user",
    "cpu_wait",
    "disk_free",
    "disk_total",
    "disk_used",
    "disk_used_perc",
    "io_read_bytes",
    "io_reads",
    "io_time",
    "io_utilization",
    "io_write_bytes",
    "io_writes",
    "mem_buffered",
    "mem_cached",
    "mem_free",
    "mem_total",
    "mem_used",
    "mem_used_perc",
    "net_bits_recv",
    "net_bits_sent",
    "net_err_in",
    "net_err_out",
    "net_packets_recv",
    "net_packets_sent",
    "swap_free",
    "swap_total",
    "swap_used",
    "swap_used_perc",
    "system_load1",
    "system_load5",
    "system_load15",
];

const PROMETHEUS_ESSENTIALS: &[&str] = &[
    "agent_status",
    "node_cpu_seconds_global",
    "node_disk_io_time_seconds_total",
    "node_disk_read_bytes_total",
    "node_disk_written_bytes_total",
    "node_filesystem_avail_bytes",
    "node_filesystem_size_bytes",
    "node_load1",
    "node_load5",
    "node_load15",
    "node_memory_Buffers_bytes",
    "node_memory_Cached_bytes",
    "node_memory_MemAvailable_bytes",
    "node_memory_MemFree_bytes",
    "node_memory_MemTotal_bytes",
    "node_network_receive_bytes_total",
    "node_network_transmit_bytes_total",
];

/// Prefixes of metric names produced by the agent itself
const BLEEMEO_BUILTIN_PREFIXES: &[&str] = &[
    "agent_", "apache_", "bind_", "cassandra_", "container_", "cpu_", "disk_", "docker_",
    "dovecot_", "elasticsearch_", "exim_", "fail2ban_", "haproxy_", "influxdb_", "io_",
    "jenkins_", "k8s_", "kubernetes_", "mem_", "memcached_", "mongodb_", "mysql_", "nats_",
    "net_", "nfs_", "nginx_", "ntp_", "openldap_", "openvpn_", "phpfpm_", "postfix_",
    "postgresql_", "probe_", "process_", "rabbitmq_", "redis_", "sensor_", "service_", "smart_",
    "squid_", "swap_", "system_", "time_", "upsd_", "uptime", "users_", "valkey_", "zookeeper_",
];

const PROMETHEUS_BUILTIN_PREFIXES: &[&str] =
    &["agent_", "container_", "glouton_", "go_", "node_", "probe_", "process_"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Network,
    Filesystem,
    Container,
    Other,
}

fn significant_mount() -> &'static Regex {
    static MOUNT: OnceLock<Regex> = OnceLock::new();
    MOUNT.get_or_init(|| Regex::new(r"^(/|/home|/srv|/var)$").expect("valid regex"))
}

fn significant_interface() -> &'static Regex {
    static INTERFACE: OnceLock<Regex> = OnceLock::new();
    INTERFACE.get_or_init(|| {
        Regex::new(r"^(eth[0-9]|ens[0-9]+(f[0-9]+)?|eno[0-9]+|enp[0-9]+s[0-9]+)$").expect("valid regex")
    })
}

/// Orders metrics by registration priority
#[derive(Debug, Clone)]
pub struct MetricComparator {
    format: MetricFormat,
    essentials: HashSet<&'static str>,
}

impl MetricComparator {
    pub fn new(format: MetricFormat) -> Self {
        let essentials = match format {
            MetricFormat::Bleemeo => BLEEMEO_ESSENTIALS,
            MetricFormat::Prometheus => PROMETHEUS_ESSENTIALS,
        };

        Self {
            format,
            essentials: essentials.iter().copied().collect(),
        }
    }

    /// Filesystem mount points and primary network interfaces.
    pub fn is_significant_item(&self, item: &str) -> bool {
        significant_mount().is_match(item) || significant_interface().is_match(item)
    }

    fn item<'a>(&self, labels: &'a Labels) -> &'a str {
        let keys: &[&str] = match self.format {
            MetricFormat::Bleemeo => &[ITEM],
            MetricFormat::Prometheus => &["mountpoint", "device", ITEM],
        };

        keys.iter()
            .find_map(|k| labels.get(*k))
            .map(String::as_str)
            .unwrap_or("")
    }

    fn family(&self, name: &str) -> Family {
        let (network, filesystem) = match self.format {
            MetricFormat::Bleemeo => ("net_", "disk_"),
            MetricFormat::Prometheus => ("node_network_", "node_filesystem_"),
        };

        if name.starts_with("container_") {
            Family::Container
        } else if name.starts_with(network) {
            Family::Network
        } else if name.starts_with(filesystem) {
            Family::Filesystem
        } else {
            Family::Other
        }
    }

    fn is_builtin(&self, name: &str) -> bool {
        let prefixes = match self.format {
            MetricFormat::Bleemeo => BLEEMEO_BUILTIN_PREFIXES,
            MetricFormat::Prometheus => PROMETHEUS_BUILTIN_PREFIXES,
        };

        self.essentials.contains(name)
            || name.ends_with("_status")
            || prefixes.iter().any(|p| name.starts_with(p))
    }

    pub fn is_essential(&self, name: &str) -> bool {
        self.essentials.contains(name)
    }

    /// Whether a metric is registered when only essential metrics are.
    pub fn keep_in_only_essential(&self, labels: &Labels) -> bool {
        let name = metric_name(labels);
        if !self.is_essential(name) {
            return false;
        }

        let item = self.item(labels);
        if item.is_empty() {
            return true;
        }

        match self.family(name) {
            Family::Network | Family::Filesystem => self.is_significant_item(item),
            Family::Container => false,
            Family::Other => true,
        }
    }

    /// Importance tier, lower is registered first.
    pub fn importance_weight(&self, labels: &Labels) -> u8 {
        let name = metric_name(labels);
        let item = self.item(labels);

        if !self.is_builtin(name) {
            return 70;
        }

        let family = self.family(name);
        let essential = self.is_essential(name);
        let network_or_fs = matches!(family, Family::Network | Family::Filesystem);

        match (essential, item.is_empty(), family) {
            (true, true, _) => 0,
            (true, false, Family::Other) => 10,
            (_, false, _) if network_or_fs && self.is_significant_item(item) => 20,
            (_, true, _) => 30,
            (_, false, Family::Other) => 40,
            (_, false, Family::Network | Family::Filesystem) => 50,
            (_, false, Family::Container) => 60,
        }
    }

    /// Total order on metrics: weight, then item so that metrics of one
    /// item stay together, then name.
    pub fn compare(&self, a: &Labels, b: &Labels) -> Ordering {
        self.importance_weight(a)
            .cmp(&self.importance_weight(b))
            .then_with(|| self.item(a).cmp(self.item(b)))
            .then_with(|| metric_name(a).cmp(metric_name(b)))
            .then_with(|| a.cmp(b))
    }
}

/// Sort metrics by priority, dropping non-essential ones when asked.
pub fn prioritize_and_filter<T, F>(format: MetricFormat, mut metrics: Vec<T>, only_essential: bool, labels_of: F) -> Vec<T>
where
    F: Fn(&T) -> &Labels,
{
    let comparator = MetricComparator::new(format);

    if only_essential {
        metrics.retain(|m| comparator.keep_in_only_essential(labels_of(m)));
    }

    metrics.sort_by(|a, b| comparator.compare(labels_of(a), labels_of(b)));
    metrics
}
