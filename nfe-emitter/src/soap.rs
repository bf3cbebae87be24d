//! SOAP 1.2 framing of authority messages.

use strum::{Display, EnumIter};

use crate::{
    constants::{SOAP12_NAMESPACE, WSDL_NAMESPACE_BASE},
    response::ResponseError,
    xml::Element,
};

/// Web services used by the emitter. Each one has its own endpoint per state
/// and environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum Service {
    #[strum(serialize = "NFeAutorizacao4")]
    Authorization,
    #[strum(serialize = "NFeRetAutorizacao4")]
    ReceiptQuery,
    #[strum(serialize = "NFeConsultaProtocolo4")]
    ProtocolQuery,
    #[strum(serialize = "NFeStatusServico4")]
    StatusService,
}

impl Service {
    /// Namespace of `nfeDadosMsg` for this service.
    pub fn wsdl_namespace(self) -> String {
        format!("{WSDL_NAMESPACE_BASE}/{self}")
    }

    pub fn operation(self) -> &'static str {
        match self {
            Service::Authorization => "nfeAutorizacaoLote",
            Service::ReceiptQuery => "nfeRetAutorizacaoLote",
            Service::ProtocolQuery => "nfeConsultaNF",
            Service::StatusService => "nfeStatusServicoNF",
        }
    }

    pub fn soap_action(self) -> String {
        format!("{}/{}", self.wsdl_namespace(), self.operation())
    }

    /// `Content-Type` header. SOAP 1.2 carries the action as a parameter.
    pub fn content_type(self) -> String {
        format!(
            r#"application/soap+xml; charset=utf-8; action="{}""#,
            self.soap_action()
        )
    }

    /// Local name of the element expected inside the response body.
    pub fn response_element(self) -> &'static str {
        match self {
            Service::Authorization => "retEnviNFe",
            Service::ReceiptQuery => "retConsReciNFe",
            Service::ProtocolQuery => "retConsSitNFe",
            Service::StatusService => "retConsStatServ",
        }
    }
}

/// Wrap an already serialized message. The message is embedded verbatim so
/// that signed content reaches the authority byte for byte.
pub fn envelope(service: Service, message_xml: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><soap12:Envelope xmlns:soap12="{SOAP12_NAMESPACE}" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema"><soap12:Body><nfeDadosMsg xmlns="{}">{message_xml}</nfeDadosMsg></soap12:Body></soap12:Envelope>"#,
        service.wsdl_namespace()
    )
}

/// Strip the envelope from a response and return the expected payload
/// element. A SOAP fault is surfaced as [`ResponseError::Fault`].
pub fn extract_payload(response: &str, service: Service) -> Result<Element, ResponseError> {
    let document = Element::parse(response).map_err(ResponseError::NotXml)?;
    if document.local_name() != "Envelope" {
        return Err(ResponseError::NotSoapEnvelope);
    }
    let body = document.child("Body").ok_or(ResponseError::MissingBody)?;

    if let Some(fault) = body.child("Fault") {
        // SOAP 1.2 nests the code value; SOAP 1.1 faults use faultcode.
        let code = fault
            .child("Code")
            .and_then(|code| code.child_text("Value"))
            .or_else(|| fault.child_text("faultcode"))
            .unwrap_or_default();
        let reason = fault
            .child("Reason")
            .and_then(|reason| reason.child_text("Text"))
            .or_else(|| fault.child_text("faultstring"))
            .unwrap_or_default();
        return Err(ResponseError::Fault {
            code: code.trim().to_string(),
            reason: reason.trim().to_string(),
        });
    }

    // Usually wrapped in nfeResultMsg, but some states put it directly in
    // the body.
    let expected = service.response_element();
    body.find(expected)
        .cloned()
        .ok_or(ResponseError::MissingElement(expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn services_name_their_actions() {
        assert_eq!(
            Service::Authorization.soap_action(),
            "http://www.portalfiscal.inf.br/nfe/wsdl/NFeAutorizacao4/nfeAutorizacaoLote"
        );
        assert_eq!(
            Service::StatusService.content_type(),
            r#"application/soap+xml; charset=utf-8; action="http://www.portalfiscal.inf.br/nfe/wsdl/NFeStatusServico4/nfeStatusServicoNF""#
        );
    }

    #[test]
    fn envelope_embeds_message_verbatim() {
        let message = r#"<consStatServ xmlns="http://www.portalfiscal.inf.br/nfe" versao="4.00"><tpAmb>2</tpAmb></consStatServ>"#;
        let soap = envelope(Service::StatusService, message);
        assert!(soap.contains(message));

        let parsed = Element::parse(&soap).unwrap();
        assert_eq!(parsed.name(), "soap12:Envelope");
        let dados = parsed.find("nfeDadosMsg").unwrap();
        assert_eq!(
            dados.attribute("xmlns"),
            Some("http://www.portalfiscal.inf.br/nfe/wsdl/NFeStatusServico4")
        );
    }

    #[test]
    fn payload_is_found_inside_result_message() {
        let response = r#"<?xml version="1.0" encoding="utf-8"?>
<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope">
  <env:Body>
    <nfeResultMsg xmlns="http://www.portalfiscal.inf.br/nfe/wsdl/NFeStatusServico4">
      <retConsStatServ xmlns="http://www.portalfiscal.inf.br/nfe" versao="4.00"><cStat>107</cStat></retConsStatServ>
    </nfeResultMsg>
  </env:Body>
</env:Envelope>"#;
        let payload = extract_payload(response, Service::StatusService).unwrap();
        assert_eq!(payload.child_text("cStat").unwrap(), "107");
    }

    #[test]
    fn faults_and_bad_frames_are_reported() {
        let fault = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"><soap:Body><soap:Fault><soap:Code><soap:Value>soap:Receiver</soap:Value></soap:Code><soap:Reason><soap:Text xml:lang="pt">Servidor indisponivel</soap:Text></soap:Reason></soap:Fault></soap:Body></soap:Envelope>"#;
        match extract_payload(fault, Service::Authorization) {
            Err(ResponseError::Fault { code, reason }) => {
                assert_eq!(code, "soap:Receiver");
                assert_eq!(reason, "Servidor indisponivel");
            }
            other => panic!("unexpected result {other:?}"),
        }

        assert!(matches!(
            extract_payload("<html><body>502</body></html>", Service::Authorization),
            Err(ResponseError::NotSoapEnvelope)
        ));
        assert!(matches!(
            extract_payload("not xml at all <", Service::Authorization),
            Err(ResponseError::NotXml(_))
        ));
        assert!(matches!(
            extract_payload(
                r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"><soap:Body><other/></soap:Body></soap:Envelope>"#,
                Service::Authorization
            ),
            Err(ResponseError::MissingElement("retEnviNFe"))
        ));
    }
}
