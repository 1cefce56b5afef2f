use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::Record;
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};

pub const IN_ADDR_ARPA: &str = "in-addr.arpa.";

/// 解析 `d4.d3.d2.d1.in-addr.arpa.` 形式的反查名，返回正序的 32 位地址。
/// 后缀比较对大小写不敏感；任何不合形式的输入返回 None。
pub fn ptr_name_to_u32(name: &str) -> Option<u32> {
    if name.len() <= IN_ADDR_ARPA.len() {
        return None;
    }
    let split = name.len() - IN_ADDR_ARPA.len();
    let (quads, suffix) = name.split_at(split);
    if !suffix.eq_ignore_ascii_case(IN_ADDR_ARPA) || !quads.ends_with('.') {
        return None;
    }
    let mut octets = [0u8; 4];
    let mut n = 0;
    for part in quads.split_terminator('.') {
        if n == 4 {
            return None;
        }
        octets[n] = part.parse::<u8>().ok()?;
        n += 1;
    }
    if n != 4 {
        return None;
    }
    // 反查名标签序是地址字节序的倒序
    Some(u32::from_be_bytes([octets[3], octets[2], octets[1], octets[0]]))
}

/// 缓存寿命取第一条回答的 TTL，但不低于配置下限；
/// 无回答（如 NXDOMAIN）视同下限。
pub fn response_ttl(msg: &Message, min_ttl: Duration) -> Duration {
    match msg.answers().first() {
        Some(rr) => min_ttl.max(Duration::from_secs(rr.ttl() as u64)),
        None => min_ttl,
    }
}

/// 以请求为模板构造应答：沿用事务 ID 与问题段，附加给定回答。
pub fn build_response(req: &Message, rcode: ResponseCode, answers: Vec<Record>) -> Result<Bytes> {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_response_code(rcode);
    for q in req.queries() {
        msg.add_query(q.clone());
    }
    for ans in answers {
        msg.add_answer(ans);
    }
    encode(&msg)
}

pub fn encode(msg: &Message) -> Result<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder)?;
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData};

    #[test]
    fn ptr_name_round_trip() {
        let ip = ptr_name_to_u32("1.1.168.192.in-addr.arpa.").expect("valid ptr name");
        assert_eq!(Ipv4Addr::from(ip), Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(
            ptr_name_to_u32("8.8.4.4.IN-ADDR.ARPA."),
            Some(u32::from(Ipv4Addr::new(4, 4, 8, 8)))
        );
    }

    #[test]
    fn ptr_name_rejects_malformed() {
        for bad in [
            "example.com.",
            "in-addr.arpa.",
            "1.2.3.in-addr.arpa.",
            "1.2.3.4.5.in-addr.arpa.",
            "1.2.3.256.in-addr.arpa.",
            "1.2.3.-4.in-addr.arpa.",
            "1.2.3.4in-addr.arpa.",
            "b._dns-sd._udp.0.1.168.192.in-addr.arpa.",
        ] {
            assert_eq!(ptr_name_to_u32(bad), None, "should reject {bad}");
        }
    }

    fn answered(ttl: u32) -> Message {
        let mut msg = Message::new();
        let name = Name::from_str("www.example.com.").unwrap();
        msg.add_answer(Record::from_rdata(
            name,
            ttl,
            RData::A(A(Ipv4Addr::new(1, 2, 3, 4))),
        ));
        msg
    }

    #[test]
    fn ttl_floors_at_min() {
        let min = Duration::from_secs(48 * 3600);
        assert_eq!(response_ttl(&answered(60), min), min);
        assert_eq!(
            response_ttl(&answered(60 * 60 * 72), min),
            Duration::from_secs(60 * 60 * 72)
        );
        // answerless responses fall back to the floor
        assert_eq!(response_ttl(&Message::new(), min), min);
    }

    #[test]
    fn build_response_echoes_id_and_question() {
        use hickory_proto::op::Query;
        use hickory_proto::rr::RecordType;
        use hickory_proto::serialize::binary::BinDecodable;

        let mut req = Message::new();
        req.set_id(0x1234);
        let mut q = Query::new();
        q.set_name(Name::from_str("www.example.com.").unwrap());
        q.set_query_type(RecordType::A);
        req.add_query(q);

        let bytes = build_response(&req, ResponseCode::Refused, Vec::new()).unwrap();
        let res = Message::from_bytes(&bytes).unwrap();
        assert_eq!(res.id(), 0x1234);
        assert_eq!(res.response_code(), ResponseCode::Refused);
        assert_eq!(res.queries().len(), 1);
        assert!(res.answers().is_empty());
    }
}
