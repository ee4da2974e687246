//! 시퀀스 번호 연산과 수신 윈도우
//!
//! 시퀀스는 16비트이며 65536에서 wrap 된다. 비교는 항상 절반 범위(32768)
//! 기준의 wrap-aware 비교를 사용한다.

use std::collections::HashSet;

/// 시퀀스 번호 (16비트, wrap)
pub type Sequence = u16;

/// wrap-aware 비교의 기준이 되는 절반 범위
pub const HALF_RANGE: u16 = 32768;

/// ack 비트맵이 덮는 이전 시퀀스 수
pub const ACK_BITMAP_BITS: u16 = 32;

/// `s1`이 `s2`보다 뒤(최신)인지 wrap 고려하여 비교
pub fn sequence_greater_than(s1: Sequence, s2: Sequence) -> bool {
    ((s1 > s2) && (s1 - s2 <= HALF_RANGE)) || ((s1 < s2) && (s2 - s1 > HALF_RANGE))
}

pub fn sequence_less_than(s1: Sequence, s2: Sequence) -> bool {
    sequence_greater_than(s2, s1)
}

/// 수신 시퀀스 분류 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// 이미 받은 시퀀스 (연속 구간 이하이거나 이미 표시됨)
    Duplicate,
    /// 기대하던 다음 시퀀스
    InOrder,
    /// 빈틈 뒤에 도착 (`distance`는 기대 시퀀스로부터의 거리)
    Ahead { distance: u16 },
    /// 윈도우 밖 (표시하지 않고 버림)
    OutOfWindow,
}

/// 상대가 보낸 신뢰성 메시지의 수신 이력
///
/// - `expected`: 다음으로 기대하는 연속 시퀀스
/// - `ahead`: `expected` 이후에 먼저 도착한 시퀀스
/// - `latest`: 지금까지 받은 가장 최신 시퀀스 (ack_sequence로 사용)
#[derive(Debug, Clone)]
pub struct ReceiveWindow {
    expected: Sequence,
    latest: Option<Sequence>,
    advanced: bool,
    ahead: HashSet<Sequence>,
    window: u16,
}

impl ReceiveWindow {
    pub fn new(window: u16) -> Self {
        Self::starting_at(0, window)
    }

    /// 첫 기대 시퀀스를 지정하여 생성
    pub fn starting_at(expected: Sequence, window: u16) -> Self {
        Self {
            expected,
            latest: None,
            advanced: false,
            ahead: HashSet::new(),
            window: window.clamp(1, HALF_RANGE - 1),
        }
    }

    /// 다음 기대 시퀀스
    pub fn expected(&self) -> Sequence {
        self.expected
    }

    /// 연속으로 받아들인 가장 높은 시퀀스 (아직 없으면 None)
    pub fn incoming_seq(&self) -> Option<Sequence> {
        self.advanced.then(|| self.expected.wrapping_sub(1))
    }

    /// 가장 최신 수신 시퀀스
    pub fn latest(&self) -> Option<Sequence> {
        self.latest
    }

    /// 순서 밖에서 표시된 시퀀스 수
    pub fn ahead_count(&self) -> usize {
        self.ahead.len()
    }

    /// 시퀀스를 분류 (상태 변경 없음)
    pub fn classify(&self, sequence: Sequence) -> Arrival {
        let distance = sequence.wrapping_sub(self.expected);
        if distance == 0 {
            Arrival::InOrder
        } else if distance >= HALF_RANGE {
            Arrival::Duplicate
        } else if self.ahead.contains(&sequence) {
            Arrival::Duplicate
        } else if distance > self.window {
            Arrival::OutOfWindow
        } else {
            Arrival::Ahead { distance }
        }
    }

    /// 수신 표시. 연속 구간이 이어지면 `expected`를 전진시킨다.
    ///
    /// `Duplicate`/`OutOfWindow`로 분류되는 시퀀스는 무시하고 false 반환
    pub fn mark(&mut self, sequence: Sequence) -> bool {
        match self.classify(sequence) {
            Arrival::InOrder => {
                self.expected = self.expected.wrapping_add(1);
                self.advanced = true;
                while self.ahead.remove(&self.expected) {
                    self.expected = self.expected.wrapping_add(1);
                }
            }
            Arrival::Ahead { .. } => {
                self.ahead.insert(sequence);
            }
            Arrival::Duplicate | Arrival::OutOfWindow => return false,
        }

        match self.latest {
            Some(latest) if !sequence_greater_than(sequence, latest) => {}
            _ => self.latest = Some(sequence),
        }
        true
    }

    /// 송신측이 포기한 구간을 건너뛴다
    ///
    /// `floor`는 송신측의 가장 오래된 미확인 시퀀스다. 그 앞의 빈틈은 다시
    /// 오지 않으므로 `expected`를 `floor`까지 옮기고, 이어서 표시된 구간 끝까지
    /// 전진한다. 전진했으면 이전 `expected`를 반환한다.
    pub fn advance_floor(&mut self, floor: Sequence) -> Option<Sequence> {
        let skip = floor.wrapping_sub(self.expected);
        if skip == 0 || skip >= HALF_RANGE {
            return None;
        }

        let previous = self.expected;
        self.ahead.retain(|&seq| seq.wrapping_sub(previous) >= skip);
        self.expected = floor;
        self.advanced = true;
        while self.ahead.remove(&self.expected) {
            self.expected = self.expected.wrapping_add(1);
        }
        Some(previous)
    }

    /// 해당 시퀀스를 받았는지 여부
    pub fn is_received(&self, sequence: Sequence) -> bool {
        if self.ahead.contains(&sequence) {
            return true;
        }
        // expected 뒤쪽(이미 지나간 구간)은 연속 수신이 시작된 이후에만 인정
        self.advanced && sequence.wrapping_sub(self.expected) >= HALF_RANGE
    }

    /// 최신 수신 시퀀스 기준 ack 필드
    pub fn ack(&self) -> Option<Ack> {
        self.latest.map(|latest| self.ack_for(latest))
    }

    /// 지정한 시퀀스 기준 ack 필드 (중복 수신 응답용)
    pub fn ack_for(&self, sequence: Sequence) -> Ack {
        let mut bitmap = 0u32;
        for i in 0..ACK_BITMAP_BITS {
            let previous = sequence.wrapping_sub(i + 1);
            if self.is_received(previous) {
                bitmap |= 1 << i;
            }
        }
        Ack { sequence, bitmap }
    }
}

/// 헤더의 ack 필드
///
/// `bitmap`의 i번째 비트는 `sequence - 1 - i` 수신 여부
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub sequence: Sequence,
    pub bitmap: u32,
}

impl Ack {
    /// 이 ack가 확인하는 모든 시퀀스
    pub fn acknowledged(&self) -> impl Iterator<Item = Sequence> + '_ {
        std::iter::once(self.sequence).chain(
            (0..ACK_BITMAP_BITS)
                .filter(move |i| self.bitmap & (1 << i) != 0)
                .map(move |i| self.sequence.wrapping_sub(i + 1)),
        )
    }
}
