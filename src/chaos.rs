use std::net::Ipv4Addr;

use anyhow::Result;
use bytes::Bytes;
use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};

use crate::engine::Engine;
use crate::proto_utils::{build_response, ptr_name_to_u32};

/// 缓存自述查询名。
const CACHE_INFO_NAME: &str = "cache.diverge.";

/// CHAOS 类只服务 TXT 自省：缓存摘要、反查名回显、单名决策查询。
/// 其余类型一律 NOTIMP。
pub(crate) async fn handle(
    engine: &Engine,
    req: &Message,
    query: &Query,
    qname: &str,
) -> Result<Bytes> {
    if query.query_type() != RecordType::TXT {
        return build_response(req, ResponseCode::NotImp, Vec::new());
    }

    let txt = if qname.eq_ignore_ascii_case(CACHE_INFO_NAME) {
        engine.cache().info().await
    } else if let Some(ip) = ptr_name_to_u32(qname) {
        Ipv4Addr::from(ip).to_string()
    } else {
        engine.decision_name(engine.cache().get(qname).await)
    };

    let mut rr = Record::from_rdata(query.name().clone(), 0, RData::TXT(TXT::new(vec![txt])));
    rr.set_dns_class(DNSClass::CH);
    build_response(req, ResponseCode::NoError, vec![rr])
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;

    use arc_swap::ArcSwap;
    use hickory_proto::rr::Name;
    use hickory_proto::serialize::binary::BinDecodable;

    use super::*;
    use crate::cache::{Decision, MemoryCache, IP_REGION0};
    use crate::domainset::DomainSet;
    use crate::engine::Engine;
    use crate::ip4map::Ip4Map;
    use crate::proto_utils::encode;
    use crate::upstream::{Exchanger, Upstream};

    fn test_engine() -> Engine {
        let upstreams = vec![
            Upstream {
                name: "clean".to_string(),
                endpoints: vec!["127.0.0.1:1".parse().unwrap()],
            },
            Upstream {
                name: "cn".to_string(),
                endpoints: vec!["127.0.0.1:1".parse().unwrap()],
            },
        ];
        Engine::new(
            upstreams,
            Arc::new(ArcSwap::from_pointee(Ip4Map::new(2, 24).unwrap())),
            DomainSet::new(),
            Arc::new(MemoryCache::new()),
            Exchanger::new(Duration::from_millis(200), 512),
            Duration::from_secs(60),
        )
    }

    fn chaos_packet(name: &str, qtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x4242);
        let mut q = Query::new();
        q.set_name(Name::from_str(name).unwrap());
        q.set_query_type(qtype);
        q.set_query_class(DNSClass::CH);
        msg.add_query(q);
        encode(&msg).unwrap().to_vec()
    }

    fn client() -> SocketAddr {
        "127.0.0.1:5353".parse().unwrap()
    }

    fn txt_of(reply: &[u8]) -> String {
        let msg = Message::from_bytes(reply).unwrap();
        assert_eq!(msg.response_code(), ResponseCode::NoError);
        let rr = &msg.answers()[0];
        assert_eq!(rr.dns_class(), DNSClass::CH);
        assert_eq!(rr.ttl(), 0);
        match rr.data() {
            Some(RData::TXT(txt)) => txt
                .txt_data()
                .iter()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .collect(),
            other => panic!("expected TXT rdata, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reports_cache_info() {
        let engine = test_engine();
        let packet = chaos_packet("cache.diverge.", RecordType::TXT);
        let reply = engine.handle(&packet, client()).await.unwrap().unwrap();
        assert_eq!(txt_of(&reply), "map: 0 entries");
    }

    #[tokio::test]
    async fn echoes_ptr_shaped_names() {
        let engine = test_engine();
        let packet = chaos_packet("4.3.2.1.in-addr.arpa.", RecordType::TXT);
        let reply = engine.handle(&packet, client()).await.unwrap().unwrap();
        assert_eq!(txt_of(&reply), "1.2.3.4");
    }

    #[tokio::test]
    async fn names_the_cached_decision() {
        let engine = test_engine();
        let packet = chaos_packet("www.site.", RecordType::TXT);
        let reply = engine.handle(&packet, client()).await.unwrap().unwrap();
        assert_eq!(txt_of(&reply), "no decision");

        engine
            .cache()
            .set("www.site.", Decision::from_ip_tag(IP_REGION0), Duration::ZERO)
            .await;
        let reply = engine.handle(&packet, client()).await.unwrap().unwrap();
        assert_eq!(txt_of(&reply), "cn");
    }

    #[tokio::test]
    async fn non_txt_gets_notimp() {
        let engine = test_engine();
        let packet = chaos_packet("version.bind.", RecordType::A);
        let reply = engine.handle(&packet, client()).await.unwrap().unwrap();
        let msg = Message::from_bytes(&reply).unwrap();
        assert_eq!(msg.response_code(), ResponseCode::NotImp);
    }
}
