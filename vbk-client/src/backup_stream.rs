use std::io::Write;
use std::pin::Pin;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use anyhow::{format_err, Error};
use futures::stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::collector::Collector;
use crate::compression::{compress_writer, StreamCompression};

const PIPE_DEPTH: usize = 10;
const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// `Write` end of the producer/consumer pipe. Writes block once the
/// consumer falls `PIPE_DEPTH` buffers behind; a dropped consumer turns
/// into a broken pipe error on the producer side.
struct ChannelWriter(SyncSender<Vec<u8>>);

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .send(buf.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Stream implementation feeding a collector's output to the engines.
///
/// The collector (and its optional compressor) runs synchronously on a
/// blocking task and pipes buffers to the async consumer. An error on the
/// producer side shows up at the consumer's next poll; dropping the
/// stream unblocks and stops the producer.
pub struct CollectorStream {
    rx: Option<Receiver<Vec<u8>>>,
    error: Arc<Mutex<Option<String>>>,
    producer_cancel: CancellationToken,
}

impl Drop for CollectorStream {
    fn drop(&mut self) {
        self.rx = None;
        self.producer_cancel.cancel();
    }
}

impl CollectorStream {
    pub fn new(
        collector: Arc<dyn Collector>,
        job: &str,
        compression: StreamCompression,
        cancel: &CancellationToken,
    ) -> Self {
        let (tx, rx) = std::sync::mpsc::sync_channel(PIPE_DEPTH);

        let error = Arc::new(Mutex::new(None));
        let error2 = Arc::clone(&error);
        let producer_cancel = cancel.child_token();
        let producer_cancel2 = producer_cancel.clone();
        let job = job.to_string();

        tokio::task::spawn_blocking(move || {
            let result = (|| -> Result<(), Error> {
                let buffered = std::io::BufWriter::with_capacity(WRITE_BUFFER_SIZE, ChannelWriter(tx));
                let mut writer = compress_writer(buffered, compression)?;
                collector.collect(&job, &mut writer, &producer_cancel2)?;
                writer.finish()
            })();

            if let Err(err) = result {
                let mut error = error2.lock().unwrap();
                *error = Some(err.to_string());
            }
        });

        Self { rx: Some(rx), error, producer_cancel }
    }
}

impl Stream for CollectorStream {
    type Item = Result<Vec<u8>, Error>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<Option<Self::Item>> {
        {
            // limit lock scope
            let error = self.error.lock().unwrap();
            if let Some(ref msg) = *error {
                return Poll::Ready(Some(Err(format_err!("{}", msg))));
            }
        }

        match tokio::task::block_in_place(|| self.rx.as_ref().unwrap().recv()) {
            Ok(data) => Poll::Ready(Some(Ok(data))),
            Err(_) => {
                let error = self.error.lock().unwrap();
                if let Some(ref msg) = *error {
                    return Poll::Ready(Some(Err(format_err!("{}", msg))));
                }
                Poll::Ready(None) // channel closed, no error
            }
        }
    }
}
