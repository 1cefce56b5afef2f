use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::cache::{IP_PRIVATE, IP_REGION0};
use crate::domainset::DomainSet;
use crate::ip4map::Ip4Map;
use crate::upstream::Upstream;

#[derive(Parser, Debug)]
#[command(author, version, about = "split-horizon DNS forwarder", long_about = None)]
pub struct Args {
    /// 监听地址，[address]:[port] 或裸端口（绑回环）。
    #[arg(long = "listen", default_value = "127.0.0.1:53")]
    pub listen: String,
    /// 缓存条目的最小存续时间。
    #[arg(long = "min-ttl", default_value = "48h", value_parser = humantime::parse_duration)]
    pub min_ttl: Duration,
    /// 非 EDNS 上游查询的最大 UDP 应答尺寸。
    #[arg(long = "udp-size", default_value_t = 512)]
    pub udp_size: u16,
    /// 单次上游交换超时。
    #[arg(long = "upstream-timeout", default_value = "2s", value_parser = humantime::parse_duration)]
    pub upstream_timeout: Duration,
    /// redis 地址，存放归属决策；缺省用进程内缓存（注意该模式 TTL 无限）。
    #[arg(long = "redis")]
    pub redis: Option<String>,
    /// redis 网络类型，例如 "tcp"。
    #[arg(long = "redis-network", default_value = "unix")]
    pub redis_network: String,
    /// redis 数据库编号。
    #[arg(long = "redis-index", default_value_t = 0)]
    pub redis_index: i64,
    /// 逗号分隔的屏蔽域名列表。
    #[arg(long = "block")]
    pub block: Option<String>,
    /// UDP worker 数量，0 表示 CPU 核心数。
    #[arg(long = "udp-workers", default_value_t = 0)]
    pub udp_workers: usize,
    /// 启用调试日志。
    #[arg(long = "debug", default_value_t = false)]
    pub debug: bool,
    /// nameX uX nameA uA ipFileA [nameB uB ipFileB]...
    #[arg(required = true)]
    pub upstream_spec: Vec<String>,
}

/// IANA IPv4 特殊用途地址登记表节选。始终最先以保留标签装载，
/// 保证装载按前缀长度从短到长推进。
const SPECIAL_IPV4: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "240.0.0.0/4",
    "255.255.255.255/32",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub min_ttl: Duration,
    pub udp_size: usize,
    pub upstream_timeout: Duration,
    pub redis: Option<String>,
    pub redis_network: String,
    pub redis_index: i64,
    pub block: DomainSet,
    /// 0 为兜底上游，其后每个区域上游配一个 IP 列表文件
    pub upstreams: Vec<Upstream>,
    pub ip_files: Vec<PathBuf>,
    pub udp_workers: usize,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Config> {
        let listen = normalize_listen(&args.listen)?;

        let spec = &args.upstream_spec;
        if spec.len() < 5 || (spec.len() - 2) % 3 != 0 {
            bail!(
                "invalid upstream arguments: want nameX uX nameA uA ipFileA [nameB uB ipFileB]..., got {}",
                spec.len()
            );
        }
        let mut upstreams = vec![Upstream {
            name: spec[0].clone(),
            endpoints: parse_endpoints(&spec[1])
                .with_context(|| format!("upstream {}", spec[0]))?,
        }];
        let mut ip_files = Vec::new();
        let mut i = 2;
        while i + 2 < spec.len() {
            upstreams.push(Upstream {
                name: spec[i].clone(),
                endpoints: parse_endpoints(&spec[i + 1])
                    .with_context(|| format!("upstream {}", spec[i]))?,
            });
            ip_files.push(PathBuf::from(&spec[i + 2]));
            i += 3;
        }

        let mut block = match &args.block {
            Some(list) => DomainSet::from_list(list),
            None => DomainSet::new(),
        };
        block.append("home.arpa.");

        Ok(Config {
            listen,
            min_ttl: args.min_ttl,
            udp_size: args.udp_size as usize,
            upstream_timeout: args.upstream_timeout,
            redis: args.redis,
            redis_network: args.redis_network,
            redis_index: args.redis_index,
            block,
            upstreams,
            ip_files,
            udp_workers: args.udp_workers,
        })
    }

    /// 构建（或重载时重建）分类表：先特殊地址，再按区域顺序装各 IP 文件。
    /// 格子宽度按区域数取 {2, 4} 中最小可容纳者：需要 2^v_bits - 1 >= 区域数 + 2。
    pub fn build_ip_map(&self) -> Result<Ip4Map> {
        let regions = self.ip_files.len();
        let v_bits = if regions + 2 <= (1 << 2) - 1 {
            2
        } else if regions + 2 <= (1 << 4) - 1 {
            4
        } else {
            bail!("too many ip list files: {regions}");
        };
        let mut map = Ip4Map::new(v_bits, 24)?;
        for s in SPECIAL_IPV4 {
            map.set_str(s, IP_PRIVATE);
        }
        for (i, path) in self.ip_files.iter().enumerate() {
            map.load_file(path, IP_REGION0 + i as u8);
        }
        Ok(map)
    }
}

/// 裸端口绑到回环。
fn normalize_listen(listen: &str) -> Result<SocketAddr> {
    let s = if listen.contains(':') {
        listen.to_string()
    } else {
        format!("127.0.0.1:{listen}")
    };
    s.parse()
        .with_context(|| format!("parse listen address: {listen}"))
}

/// 逗号分隔的端点表；缺端口补 53，主机名在启动时就地解析。
fn parse_endpoints(list: &str) -> Result<Vec<SocketAddr>> {
    let mut endpoints = Vec::new();
    for part in list.split(',') {
        if part.is_empty() {
            continue;
        }
        let hostport = if part.contains(':') {
            part.to_string()
        } else {
            format!("{part}:53")
        };
        let addr = hostport
            .to_socket_addrs()
            .with_context(|| format!("resolve endpoint: {hostport}"))?
            .next()
            .with_context(|| format!("endpoint resolved to nothing: {hostport}"))?;
        endpoints.push(addr);
    }
    if endpoints.is_empty() {
        bail!("empty endpoint list: {list}");
    }
    Ok(endpoints)
}
