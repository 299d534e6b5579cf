use super::{InterceptHandle, PacketInterceptor, TrafficFilter};
use crate::utils::process_utils::run_checked;
use anyhow::Context;
use nfq::{Message, Queue, Verdict};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const DEFAULT_QUEUE_NUM: u16 = 7310;

/// netfilter queue interception. `open` installs NFQUEUE jumps for the
/// filtered traffic and `close` removes them again.
#[derive(Debug)]
pub struct NfqueueInterceptor {
    queue_num: u16,
}

impl Default for NfqueueInterceptor {
    fn default() -> Self {
        Self {
            queue_num: DEFAULT_QUEUE_NUM,
        }
    }
}

// SAFETY: the queue and its messages are only touched under `NfqueueHandle::queue`
// or moved between the worker and that lock; no aliasing outlives either.
struct QueueCell(Queue);
unsafe impl Send for QueueCell {}

pub struct QueuedPacket(Message);
unsafe impl Send for QueuedPacket {}

/// iptables arguments (after the chain) diverting `filter` to `queue_num`.
/// `--queue-bypass` lets traffic through if nobody is listening.
fn jump_rules(filter: TrafficFilter, queue_num: u16) -> Vec<(&'static str, Vec<String>)> {
    let matcher: &[&str] = match filter {
        TrafficFilter::Ipv4Tcp => &["-p", "tcp"],
    };
    ["OUTPUT", "INPUT"]
        .into_iter()
        .map(|chain| {
            let mut args: Vec<String> = matcher.iter().map(|s| s.to_string()).collect();
            args.extend(["-j", "NFQUEUE", "--queue-num"].iter().map(|s| s.to_string()));
            args.push(queue_num.to_string());
            args.push("--queue-bypass".to_string());
            (chain, args)
        })
        .collect()
}

fn iptables(action: &str, chain: &str, args: &[String]) -> Result<String, anyhow::Error> {
    let mut full: Vec<&str> = vec!["-w", action, chain];
    full.extend(args.iter().map(|s| s.as_str()));
    run_checked("iptables", &full)
}

pub struct NfqueueHandle {
    queue: Mutex<QueueCell>,
    queue_num: u16,
    rules: Vec<(&'static str, Vec<String>)>,
    closed: AtomicBool,
}

impl NfqueueHandle {
    fn queue(&self) -> MutexGuard<'_, QueueCell> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_rules(rules: &[(&'static str, Vec<String>)]) {
        for (chain, args) in rules {
            if let Err(e) = iptables("-D", chain, args) {
                log::warn!("Failed to remove NFQUEUE rule from {}: {:#}", chain, e);
            }
        }
    }

    fn verdict(&self, meta: QueuedPacket, verdict: Verdict) -> Result<(), anyhow::Error> {
        let mut msg = meta.0;
        msg.set_verdict(verdict);
        self.queue().0.verdict(msg).context("Failed to send verdict")
    }
}

impl PacketInterceptor for NfqueueInterceptor {
    type Handle = NfqueueHandle;

    fn open(&self, filter: TrafficFilter) -> Result<NfqueueHandle, anyhow::Error> {
        let mut queue = Queue::open().context("Failed to open netfilter queue")?;
        queue
            .bind(self.queue_num)
            .with_context(|| format!("Failed to bind netfilter queue {}", self.queue_num))?;
        queue.set_nonblocking(true);

        let rules = jump_rules(filter, self.queue_num);
        let mut installed = Vec::new();
        for (chain, args) in &rules {
            if let Err(e) = iptables("-I", chain, args) {
                NfqueueHandle::remove_rules(&installed);
                let _ = queue.unbind(self.queue_num);
                return Err(e.context(format!("Failed to divert {} traffic", chain)));
            }
            installed.push((*chain, args.clone()));
        }

        log::debug!("Netfilter queue {} bound", self.queue_num);
        Ok(NfqueueHandle {
            queue: Mutex::new(QueueCell(queue)),
            queue_num: self.queue_num,
            rules,
            closed: AtomicBool::new(false),
        })
    }
}

impl InterceptHandle for NfqueueHandle {
    type Meta = QueuedPacket;

    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, QueuedPacket)>, anyhow::Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(anyhow::anyhow!("netfilter queue closed"));
        }
        match self.queue().0.recv() {
            Ok(msg) => {
                let payload = msg.get_payload();
                let len = payload.len().min(buf.len());
                buf[..len].copy_from_slice(&payload[..len]);
                Ok(Some((len, QueuedPacket(msg))))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to receive from netfilter queue")),
        }
    }

    fn reinject(&self, _packet: &[u8], meta: QueuedPacket) -> Result<(), anyhow::Error> {
        self.verdict(meta, Verdict::Accept)
    }

    // Every queued packet needs a verdict, including the ones we drop
    fn discard(&self, meta: QueuedPacket) -> Result<(), anyhow::Error> {
        self.verdict(meta, Verdict::Drop)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        Self::remove_rules(&self.rules);
        if let Err(e) = self.queue().0.unbind(self.queue_num) {
            log::warn!("Failed to unbind netfilter queue {}: {}", self.queue_num, e);
        }
        log::debug!("Netfilter queue {} released", self.queue_num);
    }
}

impl Drop for NfqueueHandle {
    fn drop(&mut self) {
        self.close();
    }
}
