use crate::slot::{ArcAny, Slot};

/// `LogVar` is used by the log to track which `Var` was either read or written or both.
/// Depending on the state, commit has to publish the write, validate the read
/// witness or block on this value.
#[derive(Clone)]
pub enum LogVar {
    /// Var has been read.
    ///
    /// The slot captured at the first read is the witness that is validated
    /// at commit.
    Read(Slot),

    /// Var has been written and no dependency on the original exists.
    ///
    /// There is no need to check for consistency.
    Write(ArcAny),

    /// ReadWrite(witness, temporary stored value).
    ///
    /// Var has been read first and then written.
    ///
    /// It needs to be checked for consistency.
    ReadWrite(Slot, ArcAny),

    /// Var has been read on a blocked path.
    ///
    /// Don't check for consistency, but block on the var,
    /// so that the transaction wakes up when the abandoned path
    /// could run differently.
    ReadObsolete(Slot),

    /// ReadObsoleteWrite(witness, temporary stored value).
    ///
    /// Var has been read on a blocked path and then written to.
    ///
    /// Don't check for consistency, but block on the var.
    ReadObsoleteWrite(Slot, ArcAny), // Here would be WriteObsolete, but the write onlies can be discarded immediately
                                     // and don't need a representation in the log.
}

impl LogVar {
    /// Read a value and potentially upgrade the state.
    pub fn read(&mut self) -> ArcAny {
        let this;
        let val;
        match &*self {
            // Use the witness of the first read or the written value.
            Self::Read(s) => {
                return s.value().clone();
            }
            Self::Write(v) | Self::ReadWrite(_, v) => {
                return v.clone();
            }

            Self::ReadObsoleteWrite(s, v) => {
                val = v.clone();
                this = Self::ReadWrite(s.clone(), v.clone());
            }

            // Upgrade to a real Read
            Self::ReadObsolete(s) => {
                val = s.value().clone();
                this = Self::Read(s.clone());
            }
        };
        *self = this;
        val
    }

    /// Write a value and potentially upgrade the state.
    pub fn write(&mut self, w: ArcAny) {
        let this = self.clone();

        *self = match this {
            Self::Write(_) => Self::Write(w),

            // Register write
            Self::ReadObsolete(s) | Self::ReadObsoleteWrite(s, _) => Self::ReadObsoleteWrite(s, w),

            // Register write
            Self::Read(s) | Self::ReadWrite(s, _) => Self::ReadWrite(s, w),
        };
    }

    /// Turn `self` into an obsolete version, dropping any write.
    pub fn obsolete(self) -> Option<LogVar> {
        self.into_read_slot().map(LogVar::ReadObsolete)
    }

    /// Ignore all writes and get the witness slot of the first read of a var.
    pub fn into_read_slot(self) -> Option<Slot> {
        match self {
            LogVar::Read(s)
            | LogVar::ReadWrite(s, _)
            | LogVar::ReadObsolete(s)
            | LogVar::ReadObsoleteWrite(s, _) => Some(s),
            LogVar::Write(_) => None,
        }
    }
}
