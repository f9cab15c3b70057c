use std::io;

use shared::domain::{FileName, ServerAddress};
use url::Url;

/// Opens the browser-side viewer. Launch failures are reported, never fatal.
pub trait ViewerLauncher: Send + Sync {
    fn launch(&self, url: &Url) -> io::Result<()>;
}

/// Hands the URL to the desktop's default browser without waiting on it.
pub struct SystemBrowser;

impl ViewerLauncher for SystemBrowser {
    fn launch(&self, url: &Url) -> io::Result<()> {
        open::that_detached(url.as_str())
    }
}

/// Used with `--no-open`: the URL is only printed.
pub struct NoLaunch;

impl ViewerLauncher for NoLaunch {
    fn launch(&self, _url: &Url) -> io::Result<()> {
        Ok(())
    }
}

/// Page to open for a session. In file mode the viewer is pointed straight at
/// the data plane through its `url` query parameter.
pub fn viewer_url(base: &Url, file: Option<(&ServerAddress, &FileName)>) -> Url {
    let mut url = base.clone();
    if let Some((address, name)) = file {
        url.query_pairs_mut()
            .append_pair("url", address.file_url(name).as_str());
    }
    url
}
