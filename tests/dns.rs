use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use dns_relay::dns::{
    Error, Forwarder, Handler, Header, Message, OpCode, QueryClass, QueryType, Question, RData,
    ResourceRecord, ResponseCode, Upstream,
};
use dns_relay::parser;

/// Answers from a fixed table; unknown names fail like an unreachable server.
#[derive(Default)]
struct FakeResolver {
    records: HashMap<String, Ipv4Addr>,
    seen: Mutex<Vec<Message>>,
}

impl FakeResolver {
    fn with(records: &[(&str, [u8; 4])]) -> Self {
        Self {
            records: records
                .iter()
                .map(|(name, addr)| (name.to_string(), Ipv4Addr::from(*addr)))
                .collect(),
            seen: Mutex::new(vec![]),
        }
    }

    fn seen(&self) -> Vec<Message> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Upstream for FakeResolver {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, Error> {
        let query = parser::message(query).expect("forwarder sent a malformed query");
        self.seen.lock().unwrap().push(query.clone());

        let question = &query.questions[0];
        let addr = self
            .records
            .get(&question.name.to_string())
            .ok_or_else(|| Error::UpstreamUnavailable("timeout waiting for reply".to_string()))?;

        let answer = ResourceRecord::address(question.name.clone(), QueryClass::IN, 300, *addr);
        Ok(Vec::<u8>::from(&Message::response(&query, vec![answer])))
    }
}

/// Fails a number of times before handing over to the inner resolver.
struct FlakyResolver {
    failures: AtomicUsize,
    inner: FakeResolver,
}

#[async_trait]
impl Upstream for FlakyResolver {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, Error> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::UpstreamUnavailable("connection refused".to_string()));
        }

        self.inner.exchange(query).await
    }
}

struct GarbageResolver;

#[async_trait]
impl Upstream for GarbageResolver {
    async fn exchange(&self, _query: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(vec![0xff; 5])
    }
}

/// Replies with a different transaction id than the one asked for.
struct WrongIdResolver(FakeResolver);

#[async_trait]
impl Upstream for WrongIdResolver {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, Error> {
        let mut reply = self.0.exchange(query).await?;
        reply[0] ^= 0xff;
        Ok(reply)
    }
}

fn query(id: u16, opcode: OpCode, names: &[&str]) -> Message {
    let questions: Vec<Question> = names
        .iter()
        .map(|name| Question {
            name: name.parse().unwrap(),
            query_type: QueryType::A,
            query_class: QueryClass::IN,
        })
        .collect();

    Message {
        header: Header {
            id,
            opcode,
            recursion_desired: true,
            qd_count: questions.len() as u16,
            ..Header::default()
        },
        questions,
        answers: vec![],
    }
}

fn forwarding(upstream: Arc<dyn Upstream>) -> Handler {
    Handler::Forwarding(Forwarder::new(upstream))
}

#[tokio::test]
async fn it_forwards_each_question_separately() {
    let resolver = Arc::new(FakeResolver::with(&[
        ("codecrafters.io", [76, 76, 21, 21]),
        ("abc.codecrafters.io", [1, 2, 3, 4]),
    ]));
    let query = query(0x1234, OpCode::StandardQuery, &["codecrafters.io", "abc.codecrafters.io"]);

    let response = forwarding(resolver.clone()).handle(&query).await;

    let seen = resolver.seen();
    assert_eq!(seen.len(), 2);
    for (sub_query, question) in seen.iter().zip(&query.questions) {
        assert_eq!(sub_query.header.id, 0x1234);
        assert!(sub_query.header.recursion_desired);
        assert_eq!(sub_query.header.qd_count, 1);
        assert_eq!(sub_query.questions, vec![question.clone()]);
    }

    assert_eq!(response.header.id, 0x1234);
    assert_eq!(response.header.an_count, 2);
    assert_eq!(response.questions, query.questions);
    assert_eq!(response.answers[0].name, query.questions[0].name);
    assert_eq!(response.answers[0].data, RData::A([76, 76, 21, 21].into()));
    assert_eq!(response.answers[1].name, query.questions[1].name);
    assert_eq!(response.answers[1].data, RData::A([1, 2, 3, 4].into()));
}

#[tokio::test]
async fn it_skips_questions_the_upstream_fails_on() {
    let resolver = Arc::new(FakeResolver::with(&[("codecrafters.io", [76, 76, 21, 21])]));
    let query = query(0x1234, OpCode::StandardQuery, &["codecrafters.io", "abc.codecrafters.io"]);

    let response = forwarding(resolver).handle(&query).await;

    assert_eq!(response.header.id, 0x1234);
    assert_eq!(response.header.qd_count, 2);
    assert_eq!(response.header.an_count, 1);
    assert_eq!(response.header.response_code, ResponseCode::NoError);
    assert_eq!(response.answers.len(), 1);
    assert_eq!(response.answers[0].name, query.questions[0].name);
}

#[tokio::test]
async fn it_answers_unknown_opcodes_with_notimp() {
    let resolver = Arc::new(FakeResolver::with(&[("codecrafters.io", [76, 76, 21, 21])]));
    let query = query(7, OpCode::InversQuery, &["codecrafters.io"]);

    let response = forwarding(resolver).handle(&query).await;

    assert_eq!(response.header.opcode, OpCode::InversQuery);
    assert_eq!(response.header.response_code, ResponseCode::NotImplemented);
    assert_eq!(response.header.an_count, 1);
}

#[tokio::test]
async fn it_answers_unknown_opcodes_with_notimp_when_upstream_fails() {
    let resolver = Arc::new(FakeResolver::default());
    let query = query(7, OpCode::Reserved(9), &["codecrafters.io"]);

    let response = forwarding(resolver).handle(&query).await;

    assert_eq!(response.header.response_code, ResponseCode::NotImplemented);
    assert!(response.answers.is_empty());
}

#[tokio::test]
async fn it_skips_malformed_upstream_replies() {
    let query = query(1, OpCode::StandardQuery, &["codecrafters.io"]);

    let response = forwarding(Arc::new(GarbageResolver)).handle(&query).await;

    assert_eq!(response.header.an_count, 0);
    assert_eq!(response.questions, query.questions);
}

#[tokio::test]
async fn it_skips_replies_with_a_foreign_id() {
    let resolver = WrongIdResolver(FakeResolver::with(&[("codecrafters.io", [76, 76, 21, 21])]));
    let query = query(1, OpCode::StandardQuery, &["codecrafters.io"]);

    let response = forwarding(Arc::new(resolver)).handle(&query).await;

    assert!(response.answers.is_empty());
}

#[tokio::test]
async fn it_retries_an_unavailable_upstream() {
    let resolver = FlakyResolver {
        failures: AtomicUsize::new(2),
        inner: FakeResolver::with(&[("codecrafters.io", [76, 76, 21, 21])]),
    };
    let forwarder = Forwarder::new(Arc::new(resolver)).with_retries(2, Duration::from_millis(1));
    let query = query(1, OpCode::StandardQuery, &["codecrafters.io"]);

    let response = Handler::Forwarding(forwarder).handle(&query).await;

    assert_eq!(response.header.an_count, 1);
}

#[tokio::test]
async fn it_gives_up_after_the_last_retry() {
    let resolver = FlakyResolver {
        failures: AtomicUsize::new(3),
        inner: FakeResolver::with(&[("codecrafters.io", [76, 76, 21, 21])]),
    };
    let forwarder = Forwarder::new(Arc::new(resolver)).with_retries(2, Duration::from_millis(1));
    let query = query(1, OpCode::StandardQuery, &["codecrafters.io"]);

    let response = Handler::Forwarding(forwarder).handle(&query).await;

    assert_eq!(response.header.an_count, 0);
}

#[tokio::test]
async fn it_answers_locally_without_resolver() {
    let handler = Handler::Standalone {
        ttl: 60,
        addr: Ipv4Addr::new(8, 8, 8, 8),
    };
    let query = query(0x4242, OpCode::StandardQuery, &["codecrafters.io", "abc.codecrafters.io"]);

    let response = handler.handle(&query).await;

    assert_eq!(response.header.id, 0x4242);
    assert!(!response.header.authoritative_answer);
    assert!(!response.header.recursion_available);
    assert_eq!(response.header.an_count, 2);
    for (answer, question) in response.answers.iter().zip(&query.questions) {
        assert_eq!(answer.name, question.name);
        assert_eq!(answer.record_type, QueryType::A);
        assert_eq!(answer.ttl, 60);
        assert_eq!(answer.data, RData::A(Ipv4Addr::new(8, 8, 8, 8)));
    }
}
