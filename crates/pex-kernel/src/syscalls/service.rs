//! Services and sessions
//!
//! Opening a session and exchanging capabilities over one need the
//! service's consent. The kernel queues a request to the service, parks the
//! syscall with a [`ServiceCont`] and finishes it once the reply arrives.

use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;

use pex_dtu::Dtu;

use super::{Flow, Wait};
use crate::cap::{CapKind, CapType, SessObject, TableId};
use crate::com::{label_service, Service, ServiceCmd};
use crate::error::Code;
use crate::kernel::Kernel;
use crate::kif::decode_reply;
use crate::types::{CapRngDesc, CapSel, Label, VpeId};

/// What to do with a service's answer
#[derive(Debug)]
pub(crate) enum ServiceCont {
    /// Create the session capability at `dst`
    Open {
        dst: CapSel,
        srv: Weak<RefCell<Service>>,
    },
    /// Copy the capabilities the service named
    Exchange {
        obtain: bool,
        crd: CapRngDesc,
        sess: Weak<SessObject>,
    },
}

impl<D: Dtu> Kernel<D> {
    pub(super) fn handle_createsrv(
        &mut self,
        caller: VpeId,
        dst: CapSel,
        rgate: CapSel,
        name: &str,
    ) -> Result<Flow, Code> {
        if name.is_empty() {
            return Err(Code::InvArgs);
        }
        let table = TableId::Obj(caller);
        if self.caps.range_used(table, dst, 1) {
            return Err(Code::Exists);
        }
        let (_, robj) = self.rgate_of(table, rgate)?;
        let srv = self.services.create(name, caller, dst, robj)?;
        self.caps.insert(table, dst, 1, CapKind::Service(srv))?;
        log::info!(target: "services", "VPE {} provides service '{}'", caller, name);

        self.start_pending();
        Ok(Flow::done())
    }

    /// Start the VPEs whose required services all exist now
    pub(crate) fn start_pending(&mut self) {
        let services = &self.services;
        let ready = self.vpes.take_startable(|n| services.find(n).is_some());
        for id in ready {
            if let Err(e) = self.start_app(id) {
                log::warn!(target: "vpes", "Starting pending VPE {} failed: {}", id, e);
            }
        }
    }

    pub(super) fn handle_createsess(
        &mut self,
        caller: VpeId,
        dst: CapSel,
        name: &str,
        arg: u64,
    ) -> Result<Flow, Code> {
        if self.caps.range_used(TableId::Obj(caller), dst, 1) {
            return Err(Code::Exists);
        }
        let srv = self.services.find(name).ok_or(Code::NotFound)?;
        let label = {
            let mut s = srv.borrow_mut();
            if !s.owner_alive() || s.closing() {
                return Err(Code::Gone);
            }
            s.send(ServiceCmd::Open { arg }.encode())
        };
        Ok(Flow::Wait(Wait::Service {
            label,
            cont: ServiceCont::Open {
                dst,
                srv: Rc::downgrade(&srv),
            },
        }))
    }

    /// Delegate capabilities to, or obtain them from, the service behind a
    /// session
    pub(super) fn handle_exchange_sess(
        &mut self,
        caller: VpeId,
        sess: CapSel,
        crd: CapRngDesc,
        args: Vec<u64>,
        obtain: bool,
    ) -> Result<Flow, Code> {
        let table = TableId::Obj(caller);
        let sid = self.caps.get_typed(table, sess, CapType::SESS)?;
        let sobj = match &self.caps.cap(sid).kind {
            CapKind::Session(s) => s.clone(),
            _ => return Err(Code::InvArgs),
        };
        if crd.end().is_none() {
            return Err(Code::InvArgs);
        }
        if obtain && self.caps.range_used(table, crd.start, crd.count) {
            return Err(Code::Exists);
        }

        let label = {
            let mut s = sobj.srv.borrow_mut();
            if !s.owner_alive() {
                return Err(Code::Gone);
            }
            let cmd = if obtain {
                ServiceCmd::Obtain {
                    ident: sobj.ident,
                    count: crd.count,
                    args,
                }
            } else {
                ServiceCmd::Delegate {
                    ident: sobj.ident,
                    count: crd.count,
                    args,
                }
            };
            s.send(cmd.encode())
        };
        Ok(Flow::Wait(Wait::Service {
            label,
            cont: ServiceCont::Exchange {
                obtain,
                crd,
                sess: Rc::downgrade(&sobj),
            },
        }))
    }

    /// Finish the syscall waiting for the service request `label`
    pub(crate) fn service_reply(&mut self, from: VpeId, label: Label, data: &[u8]) {
        let sid = label_service(label);
        let srv = match self.services.get(sid) {
            Some(s) => s,
            None => {
                log::debug!(target: "services", "Reply {:#x} for vanished service {}", label, sid);
                return;
            }
        };
        {
            let mut s = srv.borrow_mut();
            if s.owner() != from {
                log::warn!(
                    target: "services",
                    "VPE {} replied for service '{}' it does not own",
                    from,
                    s.name()
                );
                return;
            }
            s.queue_mut().received_reply();
        }
        drop(srv);

        let pos = self
            .waits
            .iter()
            .position(|w| matches!(&w.wait, Wait::Service { label: l, .. } if *l == label));
        // close and shutdown requests have nobody waiting
        let waiter = match pos {
            Some(p) => self.waits.remove(p),
            None => return,
        };
        let cont = match waiter.wait {
            Wait::Service { cont, .. } => cont,
            _ => return,
        };
        let res = decode_reply(data).and_then(|vals| self.continue_service(waiter.vpe, cont, vals));
        self.complete(waiter.vpe, waiter.req, res);
    }

    fn continue_service(
        &mut self,
        vpe: VpeId,
        cont: ServiceCont,
        vals: Vec<u64>,
    ) -> Result<Flow, Code> {
        match cont {
            ServiceCont::Open { dst, srv } => {
                let ident = *vals.first().ok_or(Code::InvArgs)?;
                let srv = srv.upgrade().ok_or(Code::Gone)?;
                let (owner, sel, closing) = {
                    let s = srv.borrow();
                    (s.owner(), s.sel(), s.closing())
                };
                let sess = Rc::new(SessObject {
                    srv: srv.clone(),
                    ident,
                });
                // dropping `sess` tells the service
                if closing {
                    return Err(Code::Gone);
                }
                let srv_cap = self
                    .caps
                    .get_typed(TableId::Obj(owner), sel, CapType::SERV)
                    .map_err(|_| Code::Gone)?;
                match &self.caps.cap(srv_cap).kind {
                    CapKind::Service(s) if Rc::ptr_eq(s, &srv) => {}
                    _ => return Err(Code::Gone),
                }
                drop(srv);

                let id = self
                    .caps
                    .insert(TableId::Obj(vpe), dst, 1, CapKind::Session(sess))?;
                self.caps.inherit(srv_cap, id);
                log::debug!(target: "services", "VPE {}: session {:#x} at {}", vpe, ident, dst);
                Ok(Flow::done())
            }
            ServiceCont::Exchange { obtain, crd, sess } => {
                let sess = sess.upgrade().ok_or(Code::Gone)?;
                let owner = {
                    let s = sess.srv.borrow();
                    if !s.owner_alive() {
                        return Err(Code::Gone);
                    }
                    s.owner()
                };
                drop(sess);

                let srv_crd = CapRngDesc::from_raw(*vals.first().ok_or(Code::InvArgs)?);
                if srv_crd.count > crd.count {
                    return Err(Code::InvArgs);
                }
                if obtain {
                    self.copy_caps(
                        TableId::Obj(owner),
                        srv_crd.start,
                        TableId::Obj(vpe),
                        crd.start,
                        srv_crd.count,
                    )?;
                } else {
                    self.copy_caps(
                        TableId::Obj(vpe),
                        crd.start,
                        TableId::Obj(owner),
                        srv_crd.start,
                        srv_crd.count,
                    )?;
                }
                Ok(Flow::Reply(vals[1..].to_vec()))
            }
        }
    }
}
