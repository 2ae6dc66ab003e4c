#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use xlext_protocol::SandboxRpcMethod;
use xlext_sandbox::SandboxRpcRequest;

fuzz_target!(|data: &[u8]| {
    let Ok(params) = serde_json::from_slice::<Value>(data) else {
        return;
    };
    for method in SandboxRpcMethod::ALL {
        let _ = SandboxRpcRequest::parse(*method, Some(params.clone()));
    }
});
