//! 신뢰성 엔진
//!
//! - 송신 시퀀스 할당 및 미확인 송신 추적
//! - ack/비트맵 처리
//! - 지수 백오프 재전송, 최대 재시도 초과 시 실패 보고
//! - 중복 제거, 빈틈/순서 처리 (strict 모드에서는 reorder 버퍼)
//! - 송신 floor: heartbeat/ack의 시퀀스 필드는 가장 오래된 미확인 시퀀스이며,
//!   수신측은 그 앞의 빈틈을 더 기다리지 않는다
//!
//! 엔진은 상태를 갖지 않고 `&mut Connection`에 대해서만 동작한다.

use std::time::Instant;

use bytes::Bytes;

use crate::codec::{self, CodecError};
use crate::connection::{Connection, FloorNotice, PendingSend};
use crate::message::{Message, MessageTag, MessageType};
use crate::sequence::{Ack, Arrival, Sequence};
use crate::Config;

/// 인코딩된 송신 데이터그램
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub sequence: Sequence,
    pub datagram: Bytes,
}

/// 수신 처리 결과 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// 애플리케이션으로 전달할 메시지 수
    Delivered(usize),
    /// 이미 받은 시퀀스 (페이로드 폐기)
    Duplicate,
    /// 빈틈을 기다리며 버퍼에 보관
    Buffered,
    /// 윈도우/버퍼 한도 초과로 폐기 (ack 없음)
    Dropped,
    /// 애플리케이션 페이로드가 없는 메시지
    Control,
}

/// 수신 처리 결과
#[derive(Debug)]
pub struct Inbound {
    /// 이번 ack로 확인된 미확인 송신 수
    pub acked: usize,
    /// 순서대로 전달할 메시지
    pub deliver: Vec<Message>,
    /// 즉시 보낼 ack 데이터그램
    pub reply: Option<Bytes>,
    pub outcome: ReceiveOutcome,
}

/// 최대 재시도를 넘긴 신뢰성 송신
#[derive(Debug, Clone)]
pub struct FailedSend {
    pub sequence: Sequence,
    pub tag: MessageTag,
    pub payload: Bytes,
    /// 최초 전송 포함 총 전송 횟수
    pub attempts: u32,
    pub first_sent: Instant,
}

/// 재전송 검사 결과
#[derive(Debug, Default)]
pub struct Sweep {
    pub resend: Vec<Outgoing>,
    pub failed: Vec<FailedSend>,
    /// 실패 이후 새 floor를 알리는 heartbeat
    pub notice: Option<Bytes>,
}

/// 신뢰성 엔진
#[derive(Debug, Clone)]
pub struct ReliabilityEngine {
    config: Config,
}

impl ReliabilityEngine {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 애플리케이션 메시지 송신 준비
    ///
    /// 신뢰성 메시지는 시퀀스를 소비하고 미확인 목록에 들어간다.
    /// 비신뢰 메시지는 다음 시퀀스 값을 정보로만 싣는다.
    pub fn send(
        &self,
        conn: &mut Connection,
        tag: MessageTag,
        payload: Bytes,
        reliable: bool,
        now: Instant,
    ) -> Result<Outgoing, CodecError> {
        let sequence = conn.outgoing_seq;
        let message = Message {
            msg_type: MessageType::Application(tag),
            sequence,
            ack: conn.window.ack(),
            reliable,
            payload,
        };
        let datagram = codec::encode(&message)?;

        if reliable {
            conn.pending_sends.insert(
                sequence,
                PendingSend {
                    tag,
                    payload: message.payload,
                    send_time: now,
                    first_sent: now,
                    retry_count: 0,
                },
            );
            conn.outgoing_seq = sequence.wrapping_add(1);
        }
        conn.last_sent = now;

        Ok(Outgoing { sequence, datagram })
    }

    /// 컨트롤 메시지 (비신뢰, ack 피기백, 시퀀스 필드는 송신 floor)
    pub fn control(
        &self,
        conn: &mut Connection,
        msg_type: MessageType,
        payload: Bytes,
        now: Instant,
    ) -> Result<Bytes, CodecError> {
        let message = Message {
            msg_type,
            sequence: conn.send_floor(),
            ack: conn.window.ack(),
            reliable: false,
            payload,
        };
        conn.last_sent = now;
        codec::encode(&message)
    }

    /// 송신이 뜸할 때 heartbeat 생성
    pub fn heartbeat(&self, conn: &mut Connection, now: Instant) -> Option<Bytes> {
        if !conn.needs_heartbeat(now, self.config.heartbeat_interval()) {
            return None;
        }
        self.control(conn, MessageType::Heartbeat, Bytes::new(), now).ok()
    }

    /// ack를 미확인 송신 목록에 적용. 제거된 항목 수 반환
    pub fn apply_ack(&self, conn: &mut Connection, ack: Ack) -> usize {
        if conn.pending_sends.is_empty() {
            return 0;
        }
        ack.acknowledged()
            .filter(|sequence| conn.pending_sends.remove(sequence).is_some())
            .count()
    }

    /// 수신 메시지 처리
    pub fn receive(&self, conn: &mut Connection, message: Message, now: Instant) -> Inbound {
        let acked = message.ack.map_or(0, |ack| self.apply_ack(conn, ack));

        let mut inbound = Inbound {
            acked,
            deliver: Vec::new(),
            reply: None,
            outcome: ReceiveOutcome::Control,
        };

        if !message.msg_type.is_application() {
            if matches!(message.msg_type, MessageType::Heartbeat | MessageType::Ack) {
                inbound.deliver = self.skip_to_floor(conn, message.sequence);
                if !inbound.deliver.is_empty() {
                    inbound.outcome = ReceiveOutcome::Delivered(inbound.deliver.len());
                }
            }
            return inbound;
        }

        if !message.reliable {
            inbound.deliver.push(message);
            inbound.outcome = ReceiveOutcome::Delivered(1);
            return inbound;
        }

        let sequence = message.sequence;
        match conn.window.classify(sequence) {
            Arrival::Duplicate => {
                inbound.outcome = ReceiveOutcome::Duplicate;
            }
            Arrival::OutOfWindow => {
                inbound.outcome = ReceiveOutcome::Dropped;
                return inbound;
            }
            Arrival::InOrder => {
                conn.window.mark(sequence);
                inbound.deliver.push(message);
                if self.config.strict_ordering {
                    let mut next = sequence.wrapping_add(1);
                    while let Some(buffered) = conn.reorder_buffer.remove(&next) {
                        inbound.deliver.push(buffered);
                        next = next.wrapping_add(1);
                    }
                }
                inbound.outcome = ReceiveOutcome::Delivered(inbound.deliver.len());
            }
            Arrival::Ahead { .. } => {
                if self.config.strict_ordering {
                    if conn.reorder_buffer.len() >= self.config.reorder_buffer_limit {
                        // 표시하지 않으면 송신측이 나중에 재전송한다
                        inbound.outcome = ReceiveOutcome::Dropped;
                        return inbound;
                    }
                    conn.window.mark(sequence);
                    conn.reorder_buffer.insert(sequence, message);
                    inbound.outcome = ReceiveOutcome::Buffered;
                } else {
                    conn.window.mark(sequence);
                    inbound.deliver.push(message);
                    inbound.outcome = ReceiveOutcome::Delivered(1);
                }
            }
        }

        // 받은 시퀀스 기준 ack: 중복이어도 다시 확인해 송신측 재시도를 멈춘다
        let ack = conn.window.ack_for(sequence);
        inbound.reply = self.ack_datagram(conn, ack, now).ok();
        inbound
    }

    /// 상대 송신 floor 적용. strict 모드에서 풀려난 메시지를 순서대로 반환
    fn skip_to_floor(&self, conn: &mut Connection, floor: Sequence) -> Vec<Message> {
        let Some(previous) = conn.window.advance_floor(floor) else {
            return Vec::new();
        };
        if conn.reorder_buffer.is_empty() {
            return Vec::new();
        }

        let released = conn.window.expected().wrapping_sub(previous);
        let mut ready: Vec<Sequence> = conn
            .reorder_buffer
            .keys()
            .copied()
            .filter(|seq| seq.wrapping_sub(previous) < released)
            .collect();
        ready.sort_unstable_by_key(|seq| seq.wrapping_sub(previous));
        ready
            .into_iter()
            .filter_map(|seq| conn.reorder_buffer.remove(&seq))
            .collect()
    }

    fn ack_datagram(&self, conn: &mut Connection, ack: Ack, now: Instant) -> Result<Bytes, CodecError> {
        let message = Message {
            msg_type: MessageType::Ack,
            sequence: conn.send_floor(),
            ack: Some(ack),
            reliable: false,
            payload: Bytes::new(),
        };
        conn.last_sent = now;
        codec::encode(&message)
    }

    /// 재전송 검사
    ///
    /// `now - send_time > retry_timeout(retry_count)`인 항목은 재전송하고,
    /// 이미 `max_retries`번 재전송한 항목은 제거 후 실패로 보고한다.
    /// 실패가 생기면 수신측이 빈틈을 건너뛰도록 새 floor를 반복 공지한다.
    pub fn sweep(&self, conn: &mut Connection, now: Instant) -> Sweep {
        let mut sweep = Sweep::default();
        if !conn.pending_sends.is_empty() {
            self.retransmit(conn, now, &mut sweep);
        }

        if !sweep.failed.is_empty() {
            conn.floor_notice = Some(FloorNotice {
                remaining: self.config.max_retries + 1,
                attempt: 0,
                next_at: now,
            });
        }

        if let Some(notice) = conn.floor_notice.filter(|notice| now >= notice.next_at) {
            sweep.notice = self.control(conn, MessageType::Heartbeat, Bytes::new(), now).ok();
            conn.floor_notice = (notice.remaining > 1).then(|| FloorNotice {
                remaining: notice.remaining - 1,
                attempt: notice.attempt + 1,
                next_at: now + self.config.retry_timeout(notice.attempt),
            });
        }
        sweep
    }

    fn retransmit(&self, conn: &mut Connection, now: Instant, sweep: &mut Sweep) {
        let expired: Vec<Sequence> = conn
            .pending_sends
            .iter()
            .filter(|(_, pending)| {
                now.saturating_duration_since(pending.send_time)
                    > self.config.retry_timeout(pending.retry_count)
            })
            .map(|(&sequence, _)| sequence)
            .collect();

        let ack = conn.window.ack();
        for sequence in expired {
            let exhausted = conn
                .pending_sends
                .get(&sequence)
                .map_or(false, |pending| pending.retry_count >= self.config.max_retries);

            if !exhausted {
                if let Some(pending) = conn.pending_sends.get_mut(&sequence) {
                    let message = Message {
                        msg_type: MessageType::Application(pending.tag),
                        sequence,
                        ack,
                        reliable: true,
                        payload: pending.payload.clone(),
                    };
                    if let Ok(datagram) = codec::encode(&message) {
                        pending.retry_count += 1;
                        pending.send_time = now;
                        sweep.resend.push(Outgoing { sequence, datagram });
                        continue;
                    }
                }
            }

            if let Some(pending) = conn.pending_sends.remove(&sequence) {
                sweep.failed.push(FailedSend {
                    sequence,
                    tag: pending.tag,
                    payload: pending.payload,
                    attempts: pending.retry_count + 1,
                    first_sent: pending.first_sent,
                });
            }
        }

        if !sweep.resend.is_empty() {
            conn.last_sent = now;
        }
    }
}
