//! IPVS 服务表
//!
//! 解析 `ipvsadm-save -n` 的逐行输出，命令行语法交给 clap。

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use clap::Parser;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::Protocol;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealServer {
    pub ip: IpAddr,
    pub port: u16,
    pub masquerade: bool,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpvsService {
    pub protocol: Protocol,
    pub ip: IpAddr,
    pub port: u16,
    pub scheduler: String,
    pub rs: Vec<RealServer>,
}

impl IpvsService {
    /// `proto:ip:port`
    pub fn key(&self) -> String {
        service_key(self.protocol, self.ip, self.port)
    }
}

impl fmt::Display for IpvsService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

pub fn service_key(protocol: Protocol, ip: IpAddr, port: u16) -> String {
    format!("{}:{}:{}", protocol.as_str().to_lowercase(), ip, port)
}

/// 一行 ipvsadm-save 命令；-g/-i/-x/-y/-p 只接受不使用
#[allow(dead_code)]
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_help_flag = true, disable_version_flag = true)]
struct IpvsLine {
    #[arg(short = 'A')]
    add_service: bool,
    #[arg(short = 'a')]
    add_server: bool,
    #[arg(short = 't')]
    tcp_service: Option<String>,
    #[arg(short = 'u')]
    udp_service: Option<String>,
    #[arg(short = 's')]
    scheduler: Option<String>,
    #[arg(short = 'r')]
    real_server: Option<String>,
    #[arg(short = 'm')]
    masquerading: bool,
    #[arg(short = 'g')]
    gatewaying: bool,
    #[arg(short = 'i')]
    ipip: bool,
    #[arg(short = 'w')]
    weight: Option<u32>,
    #[arg(short = 'p')]
    persistent: Option<String>,
    #[arg(short = 'f')]
    fwmark: Option<u32>,
    #[arg(short = 'x')]
    upper_threshold: Option<u32>,
    #[arg(short = 'y')]
    lower_threshold: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct Ipvs {
    services: HashMap<String, IpvsService>,
}

impl Ipvs {
    pub fn parse<S: AsRef<str>>(dump: &[S]) -> Result<Self> {
        let mut ipvs = Self::default();
        for line in dump {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }
            ipvs.parse_line(line)?;
        }
        debug!(services = ipvs.services.len(), "ipvs parsed");
        Ok(ipvs)
    }

    /// 按行切分后解析
    pub fn parse_str(dump: &str) -> Result<Self> {
        Self::parse(&dump.lines().collect::<Vec<_>>())
    }

    fn parse_line(&mut self, line: &str) -> Result<()> {
        let err = |message: String| Error::IpvsParse {
            line: line.to_string(),
            message,
        };
        let args =
            IpvsLine::try_parse_from(line.split_whitespace()).map_err(|e| err(e.to_string()))?;

        if !args.add_service && !args.add_server {
            return Err(err("unknown ipvs action".to_string()));
        }

        if args.fwmark.is_some() {
            debug!(line, "skip fwmark ipvs service");
            return Ok(());
        }

        let (protocol, service) = match (&args.udp_service, &args.tcp_service) {
            (Some(udp), _) => (Protocol::Udp, udp.as_str()),
            (None, Some(tcp)) => (Protocol::Tcp, tcp.as_str()),
            (None, None) => return Err(err("missing virtual service".to_string())),
        };
        let vip: SocketAddr = service
            .parse()
            .map_err(|e| err(format!("invalid service address {service}: {e}")))?;

        if args.add_service {
            let svc = IpvsService {
                protocol,
                ip: vip.ip(),
                port: vip.port(),
                scheduler: args.scheduler.unwrap_or_default(),
                rs: Vec::new(),
            };
            self.services.insert(svc.key(), svc);
            return Ok(());
        }

        let rs = args
            .real_server
            .as_deref()
            .ok_or_else(|| err("missing real server".to_string()))?;
        let rs: SocketAddr = rs
            .parse()
            .map_err(|e| err(format!("invalid real server address {rs}: {e}")))?;
        let key = service_key(protocol, vip.ip(), vip.port());
        let svc = self
            .services
            .get_mut(&key)
            .ok_or_else(|| err(format!("service {key} not exists")))?;
        svc.rs.push(RealServer {
            ip: rs.ip(),
            port: rs.port(),
            masquerade: args.masquerading,
            weight: args.weight.unwrap_or(0),
        });
        Ok(())
    }

    pub fn service(&self, protocol: Protocol, ip: IpAddr, port: u16) -> Option<&IpvsService> {
        self.services.get(&service_key(protocol, ip, port))
    }

    pub fn services(&self) -> impl Iterator<Item = &IpvsService> {
        self.services.values()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
