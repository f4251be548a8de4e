//! Consumer task: drains the reassembly queue into the destination.
//!
//! The consumer writes at most `write_rate` bytes per `quantum`; a payload
//! larger than what is left of the current quantum is split and the
//! remainder written once the next quantum starts.  A rate of zero means
//! unbounded.  The consumer stops once the queue is closed and empty, after
//! flushing the sink.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, Instant};

use crate::chunk::write_chunk;
use crate::error::{Result, TransferError};
use crate::queue::ReassemblyQueue;

/// Byte budget per quantum.
#[derive(Debug)]
struct Throttle {
    rate: u64,
    quantum: Duration,
    budget: u64,
    quantum_start: Instant,
}

impl Throttle {
    fn new(rate: u64, quantum: Duration) -> Self {
        Self {
            rate,
            quantum,
            budget: rate,
            quantum_start: Instant::now(),
        }
    }

    /// Grant up to `wanted` bytes, waiting for the next quantum when the
    /// current one is used up.
    async fn grant(&mut self, wanted: usize) -> usize {
        if self.rate == 0 {
            return wanted;
        }
        if self.budget == 0 {
            sleep_until(self.quantum_start + self.quantum).await;
        }
        // A quantum starts with its first grant, not when the last one ran out.
        let now = Instant::now();
        if now >= self.quantum_start + self.quantum {
            self.quantum_start = now;
            self.budget = self.rate;
        }
        let granted = (wanted as u64).min(self.budget);
        self.budget -= granted;
        granted as usize
    }
}

pub struct Consumer<W> {
    queue: Arc<ReassemblyQueue>,
    sink: W,
    write_rate: u64,
    quantum: Duration,
}

impl<W> Consumer<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(queue: Arc<ReassemblyQueue>, sink: W, write_rate: u64, quantum: Duration) -> Self {
        Self {
            queue,
            sink,
            write_rate,
            quantum,
        }
    }

    /// Drain the queue until it is closed and empty.  Returns bytes written.
    pub async fn run(&mut self) -> Result<u64> {
        let mut throttle = Throttle::new(self.write_rate, self.quantum);
        let mut written = 0u64;
        loop {
            match self.queue.try_dequeue() {
                Some(segment) => {
                    let mut rest = segment.payload.as_slice();
                    while !rest.is_empty() {
                        let n = throttle.grant(rest.len()).await;
                        write_chunk(&mut self.sink, &rest[..n])
                            .await
                            .map_err(TransferError::DestinationWrite)?;
                        rest = &rest[n..];
                    }
                    written += segment.payload.len() as u64;
                    log::trace!("[consume] wrote seq={} total={written}", segment.header.seq);
                }
                None if self.queue.is_drained() => break,
                None => self.queue.readable().await,
            }
        }
        self.sink
            .flush()
            .await
            .map_err(TransferError::DestinationWrite)?;
        log::debug!("[consume] drained; {written} bytes written");
        Ok(written)
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Segment;
    use tokio::io::AsyncReadExt;

    fn fill(queue: &ReassemblyQueue, payloads: &[&[u8]]) {
        for (seq, payload) in payloads.iter().enumerate() {
            assert!(queue.try_enqueue(Segment::data(seq as u32, 0, payload.to_vec())));
        }
    }

    #[tokio::test]
    async fn writes_everything_in_order() {
        let queue = Arc::new(ReassemblyQueue::new(4));
        fill(&queue, &[b"hel", b"lo ", b"world"]);
        queue.close();
        let mut consumer = Consumer::new(queue, Vec::new(), 0, Duration::from_secs(1));
        assert_eq!(consumer.run().await.unwrap(), 11);
        assert_eq!(consumer.into_inner(), b"hello world");
    }

    #[tokio::test]
    async fn waits_for_segments_until_closed() {
        let queue = Arc::new(ReassemblyQueue::new(2));
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for i in 0..6u8 {
                    while !queue.try_enqueue(Segment::data(u32::from(i), 0, vec![i])) {
                        queue.writable().await;
                    }
                }
                queue.close();
            })
        };
        let mut consumer = Consumer::new(queue, Vec::new(), 0, Duration::from_secs(1));
        let written = tokio::time::timeout(Duration::from_secs(2), consumer.run())
            .await
            .expect("consumer hung")
            .unwrap();
        producer.await.unwrap();
        assert_eq!(written, 6);
        assert_eq!(consumer.into_inner(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn write_rate_spreads_bytes_over_quanta() {
        let queue = Arc::new(ReassemblyQueue::new(4));
        // 250 bytes at 100 bytes per second: 100 now, 100 at 1s, 50 at 2s.
        fill(&queue, &[&[1u8; 150], &[2u8; 100]]);
        queue.close();
        let started = Instant::now();
        let mut consumer = Consumer::new(queue, Vec::new(), 100, Duration::from_secs(1));
        assert_eq!(consumer.run().await.unwrap(), 250);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "finished after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "finished after {elapsed:?}");
        let out = consumer.into_inner();
        assert_eq!(&out[..150], &[1u8; 150][..]);
        assert_eq!(&out[150..], &[2u8; 100][..]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_start_does_not_bank_a_quantum() {
        let queue = Arc::new(ReassemblyQueue::new(4));
        let (sink, mut output) = tokio::io::duplex(1024);
        let mut consumer = Consumer::new(Arc::clone(&queue), sink, 100, Duration::from_secs(1));
        let task = tokio::spawn(async move { consumer.run().await });

        // Nothing arrives for three quanta.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(queue.try_enqueue(Segment::data(0, 0, vec![9u8; 250])));
        queue.close();

        // Within the first quantum after data arrives, only `rate` bytes land.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut buf = [0u8; 1024];
        let n = output.read(&mut buf).await.unwrap();
        assert_eq!(n, 100);

        assert_eq!(task.await.unwrap().unwrap(), 250);
        let mut rest = Vec::new();
        output.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len(), 150);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_is_unbounded() {
        let queue = Arc::new(ReassemblyQueue::new(4));
        fill(&queue, &[&[0u8; 1460], &[0u8; 1460], &[0u8; 1460]]);
        queue.close();
        let started = Instant::now();
        let mut consumer = Consumer::new(queue, Vec::new(), 0, Duration::from_secs(1));
        consumer.run().await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
