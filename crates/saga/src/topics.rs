use crate::workflow::Service;

/// Topic names used by the saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Order triggers: placed and cancelled.
    pub orders: String,
    pub inventory_commands: String,
    pub payment_commands: String,
    pub notification_commands: String,
    pub inventory_replies: String,
    pub payment_replies: String,
    pub notification_replies: String,
    pub dead_letter: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            orders: "orders".to_string(),
            inventory_commands: "inventory-commands".to_string(),
            payment_commands: "payment-commands".to_string(),
            notification_commands: "notification-commands".to_string(),
            inventory_replies: "inventory-replies".to_string(),
            payment_replies: "payment-replies".to_string(),
            notification_replies: "notification-replies".to_string(),
            dead_letter: "orders-dlq".to_string(),
        }
    }
}

impl Topics {
    pub fn command_topic(&self, service: Service) -> &str {
        match service {
            Service::Inventory => &self.inventory_commands,
            Service::Payment => &self.payment_commands,
            Service::Notification => &self.notification_commands,
        }
    }

    pub fn reply_topic(&self, service: Service) -> &str {
        match service {
            Service::Inventory => &self.inventory_replies,
            Service::Payment => &self.payment_replies,
            Service::Notification => &self.notification_replies,
        }
    }

    /// Every reply topic.
    pub fn reply_topics(&self) -> Vec<String> {
        vec![
            self.inventory_replies.clone(),
            self.payment_replies.clone(),
            self.notification_replies.clone(),
        ]
    }

    /// What the orchestrator consumes: the order triggers plus every reply topic.
    pub fn orchestrator_subscriptions(&self) -> Vec<String> {
        let mut topics = vec![self.orders.clone()];
        topics.extend(self.reply_topics());
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_service() {
        let topics = Topics::default();
        assert_eq!(topics.command_topic(Service::Payment), "payment-commands");
        assert_eq!(topics.reply_topic(Service::Notification), "notification-replies");
    }

    #[test]
    fn orchestrator_listens_to_orders_and_replies() {
        let topics = Topics::default();
        assert_eq!(
            topics.orchestrator_subscriptions(),
            vec![
                "orders",
                "inventory-replies",
                "payment-replies",
                "notification-replies"
            ]
        );
    }
}
