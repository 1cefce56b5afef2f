use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use bytes::Bytes;
use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::cache::{Decision, DecisionCache, IP_PRIVATE, IP_REGION0, IP_UNKNOWN};
use crate::chaos;
use crate::domainset::DomainSet;
use crate::ip4map::Ip4Map;
use crate::proto_utils::{build_response, encode, ptr_name_to_u32, response_ttl};
use crate::upstream::{Exchanger, Upstream};

/// 解析引擎：对每个请求分类，必要时并发竞速全部上游，
/// 按应答地址判定归属并异步落缓存。
#[derive(Clone)]
pub struct Engine {
    /// 0 为兜底上游，1.. 为区域上游，顺序即优先级
    upstreams: Arc<Vec<Upstream>>,
    /// 重载时整体换新，在途查询继续用旧表
    ip_map: Arc<ArcSwap<Ip4Map>>,
    block: Arc<DomainSet>,
    cache: Arc<dyn DecisionCache>,
    exchanger: Arc<Exchanger>,
    min_ttl: Duration,
}

impl Engine {
    pub fn new(
        upstreams: Vec<Upstream>,
        ip_map: Arc<ArcSwap<Ip4Map>>,
        block: DomainSet,
        cache: Arc<dyn DecisionCache>,
        exchanger: Exchanger,
        min_ttl: Duration,
    ) -> Engine {
        Engine {
            upstreams: Arc::new(upstreams),
            ip_map,
            block: Arc::new(block),
            cache,
            exchanger: Arc::new(exchanger),
            min_ttl,
        }
    }

    pub(crate) fn cache(&self) -> &Arc<dyn DecisionCache> {
        &self.cache
    }

    /// 决策的人读名字：上游名或 "no decision"。
    pub(crate) fn decision_name(&self, d: Decision) -> String {
        match d.upstream_index() {
            Some(i) if i < self.upstreams.len() => self.upstreams[i].name.clone(),
            Some(_) => format!("unknown({})", d.0),
            None => "no decision".to_string(),
        }
    }

    /// 每个数据报一次调用。返回 None 表示不回包（上游全败时静默丢弃）。
    pub async fn handle(&self, packet: &[u8], peer: SocketAddr) -> Result<Option<Bytes>> {
        let req = Message::from_bytes(packet).context("parse request")?;
        if req.queries().len() != 1 {
            debug!(n = req.queries().len(), "unexpected question count");
            return Ok(Some(build_response(&req, ResponseCode::Refused, Vec::new())?));
        }
        let query = req.queries()[0].clone();
        let mut qname = query.name().to_string();
        if !qname.ends_with('.') {
            qname.push('.');
        }
        let qtype = query.query_type();

        if query.query_class() == DNSClass::CH {
            return chaos::handle(self, &req, &query, &qname).await.map(Some);
        }
        if query.query_class() != DNSClass::IN {
            return Ok(Some(build_response(&req, ResponseCode::NotImp, Vec::new())?));
        }

        let (decision, rcode) = self.pre_check(&qname, qtype).await;
        if rcode != ResponseCode::NoError {
            info!(
                event = "dns_response",
                qname = %qname,
                qtype = ?qtype,
                rcode = ?rcode,
                client_ip = %peer.ip(),
                "answered by pre-check"
            );
            return Ok(Some(build_response(&req, rcode, Vec::new())?));
        }

        if let Some(idx) = decision.upstream_index() {
            // 已有归属：只打对应上游，应答原样转回
            let upstream = &self.upstreams[idx];
            return match self.exchanger.exchange(packet, upstream).await {
                Ok(raw) => {
                    info!(
                        event = "dns_response",
                        upstream = %upstream.name,
                        qname = %qname,
                        qtype = ?qtype,
                        client_ip = %peer.ip(),
                        "forwarded by decision"
                    );
                    Ok(Some(raw))
                }
                Err(err) => {
                    warn!(
                        event = "dns_response",
                        upstream = %upstream.name,
                        qname = %qname,
                        error = %err,
                        "decided upstream failed"
                    );
                    Ok(None)
                }
            };
        }

        if qtype == RecordType::A {
            let (decision, reply) = self.race(packet, &qname).await;
            if reply.is_some() {
                info!(
                    event = "dns_response",
                    upstream = %self.decision_name(decision),
                    qname = %qname,
                    qtype = ?qtype,
                    client_ip = %peer.ip(),
                    "resolved by race"
                );
            }
            Ok(reply)
        } else {
            self.resolve_indirect(packet, &req, &qname).await
        }
    }

    /// 前置判定：(决策, rcode)。rcode 非 NOERROR 的直接按 rcode 回复；
    /// 有决策的直达对应上游；两者皆无才进入竞速。
    async fn pre_check(&self, qname: &str, qtype: RecordType) -> (Decision, ResponseCode) {
        match qtype {
            RecordType::ANY => (Decision::NONE, ResponseCode::NotImp),
            RecordType::PTR => {
                let Some(ip) = ptr_name_to_u32(qname) else {
                    return (Decision::NONE, ResponseCode::BADNAME);
                };
                match self.ip_map.load().get(ip) {
                    IP_PRIVATE => (Decision::NONE, ResponseCode::Refused),
                    IP_UNKNOWN => (Decision::FALLBACK, ResponseCode::NoError),
                    tag => (Decision::from_ip_tag(tag), ResponseCode::NoError),
                }
            }
            _ => {
                if self.block.includes(qname) {
                    return (Decision::NONE, ResponseCode::Refused);
                }
                let d = self.cache.get(qname).await;
                // 缓存里翻出指不到上游的旧决策时当未决策处理
                match d.upstream_index() {
                    Some(i) if i >= self.upstreams.len() => {
                        warn!(qname = %qname, decision = d.0, "stale decision in cache, ignoring");
                        (Decision::NONE, ResponseCode::NoError)
                    }
                    _ => (d, ResponseCode::NoError),
                }
            }
        }
    }

    /// A 类型竞速：同一请求并发打到全部上游，结果各自送进专属槽位；
    /// 按配置顺序消费区域槽位，第一个通过后置校验的区域即胜出，
    /// 否则回落兜底。胜出后不取消落败交换，其结果送达即弃。
    /// 任何区域上游出过错就不落缓存，避免用残缺信息冻结决策。
    async fn race(&self, packet: &[u8], qname: &str) -> (Decision, Option<Bytes>) {
        let mut slots = Vec::with_capacity(self.upstreams.len());
        for upstream in self.upstreams.iter() {
            let (tx, rx) = oneshot::channel();
            let exchanger = self.exchanger.clone();
            let upstream = upstream.clone();
            let packet = packet.to_vec();
            tokio::spawn(async move {
                let _ = tx.send(exchanger.exchange(&packet, &upstream).await);
            });
            slots.push(rx);
        }

        let mut slots = slots.into_iter();
        let fallback_slot = match slots.next() {
            Some(rx) => rx,
            None => return (Decision::NONE, None),
        };

        let mut n_err = 0usize;
        for (region, rx) in slots.enumerate() {
            let name = &self.upstreams[region + 1].name;
            let raw = match rx.await {
                Ok(Ok(raw)) => raw,
                Ok(Err(err)) => {
                    debug!(upstream = %name, qname = %qname, error = %err, "regional exchange failed");
                    n_err += 1;
                    continue;
                }
                Err(_) => {
                    n_err += 1;
                    continue;
                }
            };
            let mut msg = match Message::from_bytes(&raw) {
                Ok(msg) => msg,
                Err(err) => {
                    debug!(upstream = %name, qname = %qname, error = %err, "bad regional response");
                    n_err += 1;
                    continue;
                }
            };
            let tag = IP_REGION0 + region as u8;
            if self.post_check(&mut msg, tag) {
                let decision = Decision::from_ip_tag(tag);
                if n_err == 0 {
                    self.save_decision(qname, decision, &msg);
                }
                return match encode(&msg) {
                    Ok(reply) => (decision, Some(reply)),
                    Err(err) => {
                        warn!(qname = %qname, error = %err, "re-encode of sanitised reply failed");
                        (decision, None)
                    }
                };
            }
        }

        match fallback_slot.await {
            Ok(Ok(raw)) => {
                let decision = Decision::FALLBACK;
                if n_err == 0 {
                    if let Ok(msg) = Message::from_bytes(&raw) {
                        self.save_decision(qname, decision, &msg);
                    }
                }
                (decision, Some(raw))
            }
            Ok(Err(err)) => {
                warn!(qname = %qname, error = %err, "fallback upstream failed, dropping query");
                (Decision::NONE, None)
            }
            Err(_) => (Decision::NONE, None),
        }
    }

    /// 非 A 查询：先用同名合成 A 查询跑一轮只决策的竞速，
    /// 决出归属后把原请求转给胜者；决不出就静默丢弃。
    async fn resolve_indirect(
        &self,
        packet: &[u8],
        req: &Message,
        qname: &str,
    ) -> Result<Option<Bytes>> {
        let mut probe = Message::new();
        probe.set_id(req.id());
        probe.set_recursion_desired(true);
        let mut q = Query::new();
        q.set_name(req.queries()[0].name().clone());
        q.set_query_type(RecordType::A);
        probe.add_query(q);
        let probe_packet = encode(&probe)?;

        let (decision, _probe_reply) = self.race(&probe_packet, qname).await;
        let Some(idx) = decision.upstream_index() else {
            debug!(qname = %qname, "indirect resolution undecided, dropping");
            return Ok(None);
        };
        let upstream = &self.upstreams[idx];
        match self.exchanger.exchange(packet, upstream).await {
            Ok(raw) => {
                info!(
                    event = "dns_response",
                    upstream = %upstream.name,
                    qname = %qname,
                    "resolved indirectly"
                );
                Ok(Some(raw))
            }
            Err(err) => {
                warn!(
                    event = "dns_response",
                    upstream = %upstream.name,
                    qname = %qname,
                    error = %err,
                    "indirect forward failed"
                );
                Ok(None)
            }
        }
    }

    /// 后置校验兼净化：answer 段保留非 A 记录与落在期望区域的 A 记录，
    /// additional 段同样过滤；至少剩一条区域内 A 记录才算通过。
    /// 交付给客户端的应答由此剥掉跨区域的 A 泄漏。
    fn post_check(&self, msg: &mut Message, tag: u8) -> bool {
        let ip_map = self.ip_map.load();
        let mut n_a = 0usize;

        let answers = msg.take_answers();
        let kept: Vec<Record> = answers
            .into_iter()
            .filter(|rr| match rr.data() {
                Some(RData::A(a)) => {
                    if ip_map.get_ip(a.0) == tag {
                        n_a += 1;
                        true
                    } else {
                        false
                    }
                }
                _ => true,
            })
            .collect();
        msg.insert_answers(kept);

        let additionals = msg.take_additionals();
        let before = additionals.len();
        let kept: Vec<Record> = additionals
            .into_iter()
            .filter(|rr| match rr.data() {
                Some(RData::A(a)) => ip_map.get_ip(a.0) == tag,
                _ => true,
            })
            .collect();
        let dropped = before - kept.len();
        if dropped > 0 {
            debug!(dropped, "filtered cross-region additionals");
        }
        msg.insert_additionals(kept);

        n_a > 0
    }

    /// 缓存写走后台任务，从不阻塞请求路径。
    fn save_decision(&self, qname: &str, d: Decision, msg: &Message) {
        let ttl = response_ttl(msg, self.min_ttl);
        let cache = self.cache.clone();
        let name = qname.to_string();
        tokio::spawn(async move {
            cache.set(&name, d, ttl).await;
        });
    }
}
