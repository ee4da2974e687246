//! 패킷 인터셉터
//!
//! 소켓 직전/직후의 원시 데이터그램을 검사하고 버릴 수 있다.
//! 손실 시뮬레이션이나 트래픽 검사에 사용한다.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 데이터그램 인터셉터
///
/// `false`를 반환하면 해당 데이터그램은 버려진다.
/// 수신/타이머 태스크에서 동시에 호출될 수 있다.
pub trait Interceptor: Send + Sync {
    /// 인코딩 후, 소켓 송신 직전
    fn on_send(&self, peer: SocketAddr, datagram: &[u8]) -> bool;

    /// 소켓 수신 직후, 디코딩 전
    fn on_receive(&self, peer: SocketAddr, datagram: &[u8]) -> bool;
}

pub type SharedInterceptor = Arc<dyn Interceptor>;

/// 모든 데이터그램 통과 (기본값)
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl Interceptor for PassThrough {
    fn on_send(&self, _peer: SocketAddr, _datagram: &[u8]) -> bool {
        true
    }

    fn on_receive(&self, _peer: SocketAddr, _datagram: &[u8]) -> bool {
        true
    }
}

/// 고정 시드 난수로 데이터그램을 무작위 손실
#[derive(Debug)]
pub struct RandomLoss {
    rng: Mutex<StdRng>,
    send_loss: f64,
    receive_loss: f64,
}

impl RandomLoss {
    /// 송신/수신 모두 `loss` 확률로 손실
    pub fn new(loss: f64, seed: u64) -> Self {
        Self::with_rates(loss, loss, seed)
    }

    pub fn with_rates(send_loss: f64, receive_loss: f64, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            send_loss: send_loss.clamp(0.0, 1.0),
            receive_loss: receive_loss.clamp(0.0, 1.0),
        }
    }

    fn pass(&self, loss: f64) -> bool {
        if loss <= 0.0 {
            return true;
        }
        !self.rng.lock().gen_bool(loss)
    }
}

impl Interceptor for RandomLoss {
    fn on_send(&self, _peer: SocketAddr, _datagram: &[u8]) -> bool {
        self.pass(self.send_loss)
    }

    fn on_receive(&self, _peer: SocketAddr, _datagram: &[u8]) -> bool {
        self.pass(self.receive_loss)
    }
}
