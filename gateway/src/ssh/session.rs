use log::warn;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;

#[derive(Clone, Debug)]
pub enum SshCommand {
    Data(Vec<u8>),
    Resize { cols: u32, rows: u32 },
}

pub struct SshSessionHandle {
    pub stdin: Sender<SshCommand>,
    pub stop: Option<oneshot::Sender<()>>,
}

impl SshSessionHandle {
    pub fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take()
            && stop.send(()).is_err()
        {
            warn!("ssh shell pump already stopped");
        }
    }
}
