/*!
# HPC Bridge DevKit - Fakes and helpers for tests

Library used as a dev-dependency by the kernel and the agent:
- Scripted fake worker / head node HTTP endpoint that records every request
- UDP sink collecting metric datagrams
- JSON payload builders matching the worker wire format
- Small async helpers (logging init, polling until a condition holds)
*/

pub mod fake_worker;
pub mod udp_sink;
pub mod payloads;
pub mod test_utils;

pub use fake_worker::{FakeWorker, RecordedRequest, Reply};
pub use udp_sink::UdpSink;
pub use payloads::PayloadBuilder;
pub use test_utils::{init_logging, wait_until};
