use std::io::BufRead;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{bail, Result};
use ipnet::Ipv4Net;
use rustc_hash::FxHashMap;
use tracing::warn;

/// 两级 IPv4 前缀分类表 / two-stage IPv4 prefix classifier.
///
/// 一级表是 2^s1_bits 个格子，每格 v_bits 位，打包进 u64 字；
/// 格子值 0..=2^v_bits-2 表示整个 /s1_bits 块映射到该值，
/// 哨兵值 2^v_bits-1 表示该块有更长前缀，需查二级表。
/// 二级表按前缀长度 s1_bits+1..=32 分桶，键为掩码后的网络地址。
///
/// 取 v_bits=2、s1_bits=24 时一级表 4MB，v_bits=4 时 8MB。
pub struct Ip4Map {
    v_bits: u32,
    s1_bits: u32,
    s1: Vec<u64>,
    s2: Vec<FxHashMap<u32, u8>>,
    v_mask: u64,
    s1_index_l_bits: u32,
    s1_index_l_mask: u32,
    s2_masks: Vec<u32>,
}

impl Ip4Map {
    /// v_bits 必须是 2 的幂且 >= 2（哨兵要占掉一个值，v_bits=1 没有可用标签）。
    pub fn new(v_bits: u32, s1_bits: u32) -> Result<Ip4Map> {
        if v_bits < 2 || !v_bits.is_power_of_two() || v_bits > 32 {
            bail!("v_bits must be a power of two in 2..=32, got {v_bits}");
        }
        if s1_bits == 0 || s1_bits > 32 {
            bail!("s1_bits must be in 1..=32, got {s1_bits}");
        }
        if (1u64 << s1_bits) * (v_bits as u64) < 64 {
            bail!("stage 1 smaller than one word: v_bits={v_bits} s1_bits={s1_bits}");
        }

        let s1_len = ((1u64 << s1_bits) * v_bits as u64 / 64) as usize;
        let s2_len = (32 - s1_bits) as usize;
        let mut s2_masks = vec![0u32; s2_len];
        if s2_len > 0 {
            s2_masks[s2_len - 1] = u32::MAX;
            for i in (0..s2_len - 1).rev() {
                s2_masks[i] = s2_masks[i + 1] << 1;
            }
        }
        Ok(Ip4Map {
            v_bits,
            s1_bits,
            s1: vec![0u64; s1_len],
            s2: vec![FxHashMap::default(); s2_len],
            v_mask: (1u64 << v_bits) - 1,
            s1_index_l_bits: (64 / v_bits).trailing_zeros(),
            s1_index_l_mask: (64 / v_bits) - 1,
            s2_masks,
        })
    }

    /// 最大可用标签值（哨兵之下）。
    pub fn max_value(&self) -> u8 {
        (self.v_mask - 1) as u8
    }

    /// 写入网络 net/len -> value。调用方保证 net 已按 len 掩码、value 小于哨兵。
    ///
    /// len <= s1_bits 时整块涂抹一级表；更长的前缀在一级表落哨兵、
    /// 条目进二级表。涂抹不保留已有哨兵，因此装载必须按前缀长度从短到长进行。
    pub fn set(&mut self, net: u32, len: u32, value: u8) {
        if len <= self.s1_bits {
            let blocks = 1u32 << (self.s1_bits - len);
            for i in 0..blocks {
                self.s1_set(net.wrapping_add(i << (32 - self.s1_bits)), value as u64);
            }
        } else {
            self.s1_set(net, self.v_mask);
            let index = (len - self.s1_bits - 1) as usize;
            self.s2[index].insert(net, value);
        }
    }

    /// 查询单个地址的标签。哨兵永不返回；二级表按长度从长到短扫，
    /// 第一个命中即最长前缀；全未命中返回 0。
    pub fn get(&self, ip: u32) -> u8 {
        let s1 = self.s1_get(ip);
        if s1 != self.v_mask {
            return s1 as u8;
        }
        for i in (0..self.s2.len()).rev() {
            let bucket = &self.s2[i];
            if bucket.is_empty() {
                continue;
            }
            if let Some(&v) = bucket.get(&(ip & self.s2_masks[i])) {
                return v;
            }
        }
        0
    }

    fn s1_calc_index(&self, net: u32) -> (usize, u32) {
        let index = net >> (32 - self.s1_bits);
        let index_h = index >> self.s1_index_l_bits;
        let index_l = index & self.s1_index_l_mask;
        (index_h as usize, index_l * self.v_bits)
    }

    fn s1_set(&mut self, net: u32, value: u64) {
        let (index_h, offset) = self.s1_calc_index(net);
        let p = &mut self.s1[index_h];
        *p = (*p & !(self.v_mask << offset)) | (value << offset);
    }

    fn s1_get(&self, ip: u32) -> u64 {
        let (index_h, offset) = self.s1_calc_index(ip);
        (self.s1[index_h] >> offset) & self.v_mask
    }

    /// CIDR 字符串版 set；长度缺省 32。坏输入记日志后忽略，不中断装载。
    pub fn set_str(&mut self, s: &str, value: u8) {
        let (net, len) = if s.contains('/') {
            match s.parse::<Ipv4Net>() {
                Ok(n) if n.prefix_len() > 0 => (u32::from(n.network()), n.prefix_len() as u32),
                _ => {
                    warn!(entry = %s, "invalid cidr entry");
                    return;
                }
            }
        } else {
            match s.parse::<Ipv4Addr>() {
                Ok(a) => (u32::from(a), 32),
                Err(_) => {
                    warn!(entry = %s, "invalid address entry");
                    return;
                }
            }
        };
        self.set(net, len, value);
    }

    /// 按行装载：空行与 '#' 注释跳过，坏行由 set_str 记日志后继续。
    pub fn load_list(&mut self, reader: impl BufRead, value: u8) -> std::io::Result<()> {
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.set_str(&line, value);
        }
        Ok(())
    }

    /// 打不开或读失败只记日志，保持已装载的部分可用（重载场景同样适用）。
    pub fn load_file(&mut self, path: &Path, value: u8) {
        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot open ip list");
                return;
            }
        };
        if let Err(err) = self.load_list(std::io::BufReader::new(file), value) {
            warn!(path = %path.display(), error = %err, "error loading ip list");
        }
    }

    pub fn get_ip(&self, ip: Ipv4Addr) -> u8 {
        self.get(u32::from(ip))
    }

    #[cfg(test)]
    fn get_str(&self, s: &str) -> u8 {
        s.parse::<Ipv4Addr>().map(|ip| self.get_ip(ip)).unwrap_or(0)
    }
}
