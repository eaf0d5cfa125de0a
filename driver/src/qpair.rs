// Copyright 2024 Oxide Computer Company
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use slog::{debug, o, warn, Logger};

use crate::cmdlog::CmdLogRef;
use crate::driver::Shared;
use crate::transport::{DmaBuffer, NamespaceInfo, Transport};
use crate::{NvmeCommand, NvmeError, Status};

/// A finished command, as handed to a completion handler
#[derive(Debug)]
pub struct IoCompletion {
    pub cmd: NvmeCommand,
    pub cpl: crate::Completion,
    pub buf: Option<DmaBuffer>,
    /// Caller's value from submission
    pub ctx: u64,
    pub latency: Duration,
}

impl IoCompletion {
    pub fn status(&self) -> Status {
        self.cpl.status()
    }

    pub fn is_error(&self) -> bool {
        self.cpl.is_error()
    }
}

#[derive(Debug)]
struct Pending {
    cmd: NvmeCommand,
    log_ref: Option<CmdLogRef>,
    ctx: u64,
    submitted: Instant,
}

/// An I/O submission/completion queue pair with its command log queue
///
/// Completions are only dispatched from `process_completions`, on the
/// caller's thread.
pub struct QueuePair<T: Transport> {
    qid: u16,
    transport: T,
    shared: Arc<Shared>,
    pending: HashMap<u64, Pending>,
    next_cid: u16,
    log: Logger,
}

impl<T: Transport> std::fmt::Debug for QueuePair<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("qid", &self.qid)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<T: Transport> QueuePair<T> {
    pub(crate) fn new(qid: u16, transport: T, shared: Arc<Shared>) -> Self {
        let log = shared.log.new(o!("qid" => qid));
        QueuePair {
            qid,
            transport,
            shared,
            pending: HashMap::new(),
            next_cid: 0,
            log,
        }
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn namespace_info(&self) -> NamespaceInfo {
        self.transport.namespace_info()
    }

    /// Commands submitted whose completion has not been dispatched
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Submit a fully formed command
    ///
    /// The command log entry is only written once the transport has
    /// accepted the command.
    pub fn submit(
        &mut self,
        mut cmd: NvmeCommand,
        buf: Option<DmaBuffer>,
        buffer_token: u64,
        ctx: u64,
    ) -> Result<(), NvmeError> {
        cmd.set_cid(self.next_cid);
        self.next_cid = self.next_cid.wrapping_add(1);

        let handle = self.transport.submit(&cmd, buf).map_err(|status| {
            debug!(self.log, "submit refused: {}", status);
            NvmeError::Transport(status)
        })?;

        let log_ref =
            match self.shared.cmdlog.on_submit(self.qid, &cmd, buffer_token, ctx)
            {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(self.log, "command not logged: {}", e);
                    None
                }
            };
        self.pending.insert(
            handle,
            Pending {
                cmd,
                log_ref,
                ctx,
                submitted: Instant::now(),
            },
        );
        Ok(())
    }

    /// Submit a command built from raw fields
    #[allow(clippy::too_many_arguments)]
    pub fn send_cmd_raw(
        &mut self,
        opcode: u8,
        nsid: u32,
        buf: Option<DmaBuffer>,
        cdw10: u32,
        cdw11: u32,
        cdw12: u32,
        cdw13: u32,
        cdw14: u32,
        cdw15: u32,
        ctx: u64,
    ) -> Result<(), NvmeError> {
        let mut cmd = NvmeCommand::new(opcode, nsid);
        cmd.cdw10 = cdw10;
        cmd.cdw11 = cdw11;
        cmd.cdw12 = cdw12;
        cmd.cdw13 = cdw13;
        cmd.cdw14 = cdw14;
        cmd.cdw15 = cdw15;
        self.submit(cmd, buf, 0, ctx)
    }

    /// Reap up to `max` completions (0 = all) and dispatch each to
    /// `handler`, which may submit more commands on this queue pair.
    ///
    /// Returns the number of completions reaped.
    pub fn process_completions<F>(&mut self, max: usize, mut handler: F) -> usize
    where
        F: FnMut(&mut Self, IoCompletion),
    {
        let raws = self.transport.poll(max);
        let reaped = raws.len();

        for raw in raws {
            let Some(p) = self.pending.remove(&raw.handle) else {
                debug!(self.log, "dropped completion for abandoned command";
                    "handle" => raw.handle);
                continue;
            };

            let mut cpl = raw.cpl;
            if let Some(r) = &p.log_ref {
                self.shared.cmdlog.on_complete(r, &cpl);
            }

            if p.cmd.is_read() && !cpl.is_error() && self.shared.verify_read()
            {
                if let Some(status) = self.verify_read(&p.cmd, raw.buf.as_deref())
                {
                    cpl.set_status(status);
                }
            }

            let done = IoCompletion {
                cmd: p.cmd,
                cpl,
                buf: raw.buf,
                ctx: p.ctx,
                latency: p.submitted.elapsed(),
            };
            handler(self, done);
        }
        reaped
    }

    fn verify_read(&self, cmd: &NvmeCommand, buf: Option<&[u8]>) -> Option<Status> {
        let integrity = self.shared.integrity()?;
        let buf = buf?;
        let sector_size = self.transport.namespace_info().sector_size as usize;

        match integrity.verify(buf, cmd.lba(), cmd.lba_count() as u64, sector_size)
        {
            Ok(()) => None,
            Err(e) => {
                warn!(self.log, "read verification failed: {}", e;
                    "lba" => cmd.lba(), "count" => cmd.lba_count());
                Some(Status::UNRECOVERED_READ)
            }
        }
    }

    /// Forget every pending command; their completions will be dropped
    pub fn abandon_pending(&mut self) -> usize {
        let n = self.pending.len();
        if n > 0 {
            warn!(self.log, "abandoning {} outstanding commands", n);
        }
        self.pending.clear();
        n
    }
}

impl<T: Transport> Drop for QueuePair<T> {
    fn drop(&mut self) {
        if let Err(e) = self.shared.cmdlog.clear_queue(self.qid) {
            warn!(self.log, "command log queue not released: {}", e);
        }
    }
}
