use crate::collaborators::Mailer;
use crate::router::TaskHandler;
use async_trait::async_trait;
use std::sync::Arc;
use tasklane_core::{EmailTask, NewsletterData};

pub struct EmailHandlers {
    mailer: Arc<dyn Mailer>,
}

impl EmailHandlers {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        EmailHandlers { mailer }
    }

    async fn newsletter(&self, data: NewsletterData) -> anyhow::Result<()> {
        self.mailer.send_newsletter(&data.name, &data.email).await
    }
}

#[async_trait]
impl TaskHandler<EmailTask> for EmailHandlers {
    async fn handle(&self, task: EmailTask) -> anyhow::Result<()> {
        match task {
            EmailTask::Newsletter(data) => self.newsletter(data).await,
        }
    }
}
