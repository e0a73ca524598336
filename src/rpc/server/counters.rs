//! Per-operation counters for inbound messages.

/// Successful and failed handling counts for one operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCount {
    pub success: u64,
    pub error: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Ping,
    FindNode,
    GetValue,
    PutValue,
    AddProvider,
    GetProviders,
}

/// Best-effort counters over inbound messages, snapshot through
/// [Info](crate::Info).
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub ping: OpCount,
    pub find_node: OpCount,
    pub get_value: OpCount,
    pub put_value: OpCount,
    pub add_provider: OpCount,
    pub get_providers: OpCount,

    /// Messages that decoded but carried an unknown type tag.
    pub unknown_messages: u64,
    /// Frames that failed to decode at all.
    pub malformed_messages: u64,
}

impl Counters {
    pub(crate) fn success(&mut self, operation: Operation) {
        self.slot(operation).success += 1;
    }

    pub(crate) fn error(&mut self, operation: Operation) {
        self.slot(operation).error += 1;
    }

    fn slot(&mut self, operation: Operation) -> &mut OpCount {
        match operation {
            Operation::Ping => &mut self.ping,
            Operation::FindNode => &mut self.find_node,
            Operation::GetValue => &mut self.get_value,
            Operation::PutValue => &mut self.put_value,
            Operation::AddProvider => &mut self.add_provider,
            Operation::GetProviders => &mut self.get_providers,
        }
    }
}
