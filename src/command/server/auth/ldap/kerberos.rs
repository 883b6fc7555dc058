use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use kerberos_asn1::{ApReq, Asn1Object, Authenticator, EncTicketPart, PrincipalName};
use kerberos_crypto::new_kerberos_cipher;
use tracing::debug;

use crate::command::server::auth::ldap::keytab::Keytab;
use crate::command::server::error::Error;

const KEY_USAGE_TICKET: i32 = 2;
const KEY_USAGE_AUTHENTICATOR: i32 = 11;
/// Tolerated difference between the client's and our clocks.
const MAX_CLOCK_SKEW_MINUTES: i64 = 5;

/// Turns a Kerberos token into the authenticated client principal.
#[cfg_attr(test, mockall::automock)]
pub trait TicketValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<String, Error>;
}

/// Validates AP-REQ messages against the service's long-term keys.
pub struct ApReqValidator {
    keytab: Keytab,
    /// `primary/instance`, realm excluded.
    service_principal: Option<Vec<String>>,
}

impl ApReqValidator {
    pub fn new(keytab: Keytab, service_principal: Option<&str>) -> Self {
        let service_principal = service_principal
            .filter(|name| !name.is_empty())
            .map(|name| {
                let name = name.split('@').next().unwrap_or(name);
                name.split('/').map(String::from).collect()
            });

        Self {
            keytab,
            service_principal,
        }
    }

    fn decrypt(key: &[u8], etype: i32, usage: i32, cipher: &[u8]) -> Result<Vec<u8>, Error> {
        let kerberos_cipher = new_kerberos_cipher(etype).map_err(|e| {
            Error::TokenInvalid(format!("unsupported encryption type {etype}: {e:?}"))
        })?;

        kerberos_cipher
            .decrypt(key, usage, cipher)
            .map_err(|e| Error::TokenInvalid(format!("unable to decrypt: {e:?}")))
    }
}

fn principal_name(name: &PrincipalName) -> String {
    name.name_string.join("/")
}

/// The ticket must be inside its `starttime..endtime` window and the
/// authenticator fresh, both within the clock skew.
fn check_times(
    ticket: &EncTicketPart,
    authenticator: &Authenticator,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let skew = Duration::minutes(MAX_CLOCK_SKEW_MINUTES);

    let start = ticket.starttime.as_ref().unwrap_or(&ticket.authtime).time.time;
    if start > now + skew {
        return Err(Error::TokenInvalid(format!("ticket is not valid before {start}")));
    }

    let end = ticket.endtime.time.time;
    if now > end + skew {
        return Err(Error::TokenInvalid(format!("ticket expired at {end}")));
    }

    let ctime = authenticator.ctime.time.time;
    if (now - ctime).abs() > skew {
        return Err(Error::TokenInvalid(format!(
            "authenticator time {ctime} is outside the clock skew window"
        )));
    }
    Ok(())
}

impl TicketValidator for ApReqValidator {
    fn validate(&self, token: &str) -> Result<String, Error> {
        self.validate_at(token, Utc::now())
    }
}

impl ApReqValidator {
    fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Result<String, Error> {
        let data = STANDARD
            .decode(token.trim())
            .map_err(|e| Error::TokenInvalid(format!("unable to decode token: {e}")))?;

        let (_, ap_req) = ApReq::parse(&data)
            .map_err(|e| Error::TokenInvalid(format!("unable to unmarshal AP-REQ: {e:?}")))?;

        let ticket = &ap_req.ticket;
        let server = principal_name(&ticket.sname);
        debug!("AP-REQ for {server}@{}", ticket.realm);

        if let Some(expected) = &self.service_principal {
            if &ticket.sname.name_string != expected {
                return Err(Error::TokenInvalid(format!(
                    "ticket was issued for {server}, not {}",
                    expected.join("/")
                )));
            }
        }

        let entry = self
            .keytab
            .find(
                &ticket.sname.name_string,
                &ticket.realm,
                ticket.enc_part.etype,
                ticket.enc_part.kvno,
            )
            .ok_or_else(|| {
                Error::TokenInvalid(format!(
                    "no key in keytab for {server}@{} (etype {}, kvno {:?})",
                    ticket.realm, ticket.enc_part.etype, ticket.enc_part.kvno
                ))
            })?;

        let plain = Self::decrypt(
            &entry.key,
            ticket.enc_part.etype,
            KEY_USAGE_TICKET,
            &ticket.enc_part.cipher,
        )?;
        let (_, ticket_part) = EncTicketPart::parse(&plain)
            .map_err(|e| Error::TokenInvalid(format!("unable to unmarshal ticket: {e:?}")))?;

        let session_key = &ticket_part.key;
        let plain = Self::decrypt(
            &session_key.keyvalue,
            ap_req.authenticator.etype,
            KEY_USAGE_AUTHENTICATOR,
            &ap_req.authenticator.cipher,
        )?;
        let (_, authenticator) = Authenticator::parse(&plain)
            .map_err(|e| Error::TokenInvalid(format!("unable to unmarshal authenticator: {e:?}")))?;

        if authenticator.cname.name_string != ticket_part.cname.name_string
            || authenticator.crealm != ticket_part.crealm
        {
            return Err(Error::TokenInvalid(
                "authenticator client does not match ticket client".to_string(),
            ));
        }
        check_times(&ticket_part, &authenticator, now)?;

        Ok(principal_name(&ticket_part.cname))
    }
}
